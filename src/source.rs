pub mod buffer;
pub mod playback;
pub mod wav;

use crate::lock;
use std::sync::{Arc, Mutex};

/// An audio source. Anything implementing this trait may be registered with a [`Mixer`](crate::Mixer) or driven
/// by an [`OutputPump`](crate::OutputPump).
///
/// Sources always produce interleaved stereo 16-bit samples at the system output rate.
pub trait AudioSource: Send {
    /// Writes up to `target.len()` interleaved stereo samples into `target`.
    ///
    /// Returns how many samples were actually written, starting from the front of `target`. Returning 0 means
    /// silence; it is not an error.
    fn pull_audio(&mut self, target: &mut [i16]) -> usize;

    /// Whether the owner may drop this source. Mixers check this once per pull and release anything that
    /// reports `true`.
    fn can_be_destroyed(&self) -> bool {
        false
    }

    /// The mixer behind this source, if it is one. Lets a mixer refuse registrations that would form a cycle.
    fn as_mixer(&self) -> Option<&crate::Mixer> {
        None
    }

    /// Tells the source what rate its output is consumed at. Called when it joins a mixer or a pump.
    fn set_output_rate(&mut self, _rate: u32) {}

    /// Moves any pending completion notices into `notices`.
    ///
    /// Whoever drives the source runs them once it holds no audio locks, so a notice may safely call back into
    /// a mixer.
    fn take_finished(&mut self, _notices: &mut Vec<FinishedNotice>) {}
}

/// A completion callback waiting to be run.
#[derive(Clone)]
pub struct FinishedNotice(Arc<Mutex<dyn FnMut() + Send>>);

impl FinishedNotice {
    pub(crate) fn new(callback: impl FnMut() + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(callback)))
    }

    /// Runs the callback.
    pub fn notify(&self) {
        let mut callback = lock(&self.0);
        (&mut *callback)();
    }
}

impl std::fmt::Debug for FinishedNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FinishedNotice")
    }
}

/// Runs and clears a batch of notices.
pub(crate) fn notify_all(notices: &mut Vec<FinishedNotice>) {
    for notice in notices.drain(..) {
        notice.notify();
    }
}

/// A source shared between its controller and a mixer.
pub type SharedSource = Arc<Mutex<dyn AudioSource>>;

/// Address of a shared source, used for identity comparisons.
pub(crate) fn source_addr(source: &SharedSource) -> *const () {
    Arc::as_ptr(source) as *const ()
}
