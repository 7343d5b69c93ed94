use crate::{
    from_fixed_gain, lock,
    source::{notify_all, source_addr, AudioSource, FinishedNotice, SharedSource},
    to_fixed_gain, FIXED_ONE, FIXED_SHIFT, OUTPUT_SAMPLE_RATE,
};
use std::sync::{Arc, Mutex};
use tracing::debug;

// Initial capacity for the Vec of audio sources in a Mixer
const SOURCES_INIT_CAPACITY: usize = 16;

/// How samples from different sources are combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SummingMode {
    /// Plain 16-bit addition. Loud mixes wrap around.
    Wrapping,

    /// Additions clamp at the 16-bit limits.
    Saturating,
}

impl Default for SummingMode {
    fn default() -> Self {
        SummingMode::Wrapping
    }
}

/// A mixer volume that changed, with its new value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VolumeChange {
    Absolute(f32),
    General(f32),
}

type VolumeListener = Box<dyn Fn(VolumeChange) + Send + Sync>;

/// A simple additive mixer. Mixes any number of sources into one interleaved stereo stream.
///
/// `Mixer` is a handle: clones share the same source list, so one clone can be handed to an
/// [`OutputPump`](crate::OutputPump) while another stays with the control thread. Every operation takes the same
/// lock, so adding, removing and mixing never interleave. Sources that report
/// [`can_be_destroyed`](AudioSource::can_be_destroyed) are released after the pull that sees them finish.
#[derive(Clone)]
pub struct Mixer {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    listeners: Mutex<Vec<VolumeListener>>,
}

struct Entry {
    source: SharedSource,
    // Mixers are keyed by their state, so two wrappers of one mixer count as the same source
    id: usize,
}

struct State {
    sources: Vec<Entry>,
    mixing_buffer: Vec<i16>,
    fixed_absolute_volume: i32,
    fixed_general_volume: i32,
    summing: SummingMode,
    output_rate: u32,
    pending: Vec<FinishedNotice>,
}

impl Mixer {
    pub fn new() -> Self {
        Self::with_summing(SummingMode::default())
    }

    pub fn with_summing(summing: SummingMode) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    sources: Vec::with_capacity(SOURCES_INIT_CAPACITY),
                    mixing_buffer: Vec::new(),
                    fixed_absolute_volume: FIXED_ONE,
                    fixed_general_volume: FIXED_ONE,
                    summing,
                    output_rate: OUTPUT_SAMPLE_RATE,
                    pending: Vec::new(),
                }),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Wraps a handle to this mixer so it can be registered with another mixer as a sub-mix.
    pub fn shared(&self) -> SharedSource {
        Arc::new(Mutex::new(self.clone()))
    }

    /// Whether two handles refer to the same mixer.
    pub fn same_mixer(&self, other: &Mixer) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Registers a source to be mixed into this mixer's output, and hands it this mixer's output rate.
    ///
    /// Returns `false`, leaving the mixer unchanged, if the source is already registered or would make this mixer
    /// part of its own mix.
    pub fn add_source(&self, source: SharedSource) -> bool {
        // Inspected before taking our own lock; mixing locks state first and sources second
        let (id, sub_mixer) = {
            let guard = lock(&source);
            let sub_mixer = guard.as_mixer().cloned();
            (entry_id(&source, sub_mixer.as_ref()), sub_mixer)
        };
        if sub_mixer.map_or(false, |sub| sub.contains_mixer(self)) {
            debug!("refusing to add a mixer that contains this one");
            return false;
        }

        let mut state = lock(&self.shared.state);
        if state.sources.iter().any(|entry| entry.id == id) {
            debug!("source is already registered");
            return false;
        }
        lock(&source).set_output_rate(state.output_rate);
        state.sources.push(Entry { source, id });
        true
    }

    /// Unregisters a source without touching it. Returns `false` if it wasn't registered.
    pub fn remove_source(&self, source: &SharedSource) -> bool {
        let id = {
            let guard = lock(source);
            entry_id(source, guard.as_mixer())
        };

        let mut state = lock(&self.shared.state);
        match state.sources.iter().position(|entry| entry.id == id) {
            Some(index) => {
                state.sources.remove(index);
                true
            }
            None => false,
        }
    }

    /// Releases every registered source.
    pub fn destroy_list(&self) {
        let sources = std::mem::take(&mut lock(&self.shared.state).sources);
        // Dropped outside the lock, in case a source's drop is slow
        drop(sources);
    }

    pub fn audio_source_count(&self) -> usize {
        lock(&self.shared.state).sources.len()
    }

    /// The rate this mixer's output is consumed at. Registered sources resample to it.
    pub fn output_rate(&self) -> u32 {
        lock(&self.shared.state).output_rate
    }

    /// Changes the output rate for this mixer and everything registered with it, nested mixers included.
    pub fn set_output_rate(&self, rate: u32) {
        let mut state = lock(&self.shared.state);
        if state.output_rate != rate {
            debug!("mixer output rate {} -> {} Hz", state.output_rate, rate);
        }
        state.output_rate = rate;
        for entry in &state.sources {
            lock(&entry.source).set_output_rate(rate);
        }
    }

    /// Gain applied to every source as it is summed.
    pub fn absolute_volume(&self) -> f32 {
        from_fixed_gain(lock(&self.shared.state).fixed_absolute_volume)
    }

    /// Gain applied to the finished mix.
    pub fn general_volume(&self) -> f32 {
        from_fixed_gain(lock(&self.shared.state).fixed_general_volume)
    }

    pub fn set_absolute_volume(&self, volume: f32) {
        let fixed = to_fixed_gain(volume);
        let changed = {
            let mut state = lock(&self.shared.state);
            std::mem::replace(&mut state.fixed_absolute_volume, fixed) != fixed
        };
        if changed {
            self.notify(VolumeChange::Absolute(from_fixed_gain(fixed)));
        }
    }

    pub fn set_general_volume(&self, volume: f32) {
        let fixed = to_fixed_gain(volume);
        let changed = {
            let mut state = lock(&self.shared.state);
            std::mem::replace(&mut state.fixed_general_volume, fixed) != fixed
        };
        if changed {
            self.notify(VolumeChange::General(from_fixed_gain(fixed)));
        }
    }

    /// Registers a callback for volume changes. It only runs when a stored volume actually changes.
    pub fn on_volume_changed(&self, listener: impl Fn(VolumeChange) + Send + Sync + 'static) {
        lock(&self.shared.listeners).push(Box::new(listener));
    }

    pub fn summing_mode(&self) -> SummingMode {
        lock(&self.shared.state).summing
    }

    pub fn set_summing_mode(&self, summing: SummingMode) {
        lock(&self.shared.state).summing = summing;
    }

    /// Mixes every registered source into `target`, which is overwritten.
    ///
    /// Returns the largest sample count any single source produced. Samples past that count are silence. Completion
    /// callbacks of sources that finished during the pass run after the mixer's lock is released.
    pub fn mix(&self, target: &mut [i16]) -> usize {
        let (produced, mut notices) = {
            let mut state = lock(&self.shared.state);
            let produced = state.mix(target);
            (produced, std::mem::take(&mut state.pending))
        };
        notify_all(&mut notices);
        produced
    }

    /// Whether `target` is this mixer or is registered anywhere beneath it.
    fn contains_mixer(&self, target: &Mixer) -> bool {
        if self.same_mixer(target) {
            return true;
        }

        let children: Vec<SharedSource> =
            lock(&self.shared.state).sources.iter().map(|entry| entry.source.clone()).collect();
        children.iter().any(|child| {
            let sub_mixer = lock(child).as_mixer().cloned();
            sub_mixer.map_or(false, |sub| sub.contains_mixer(target))
        })
    }

    fn notify(&self, change: VolumeChange) {
        for listener in lock(&self.shared.listeners).iter() {
            listener(change);
        }
    }
}

impl State {
    fn mix(&mut self, target: &mut [i16]) -> usize {
        target.iter_mut().for_each(|s| *s = 0);
        if self.mixing_buffer.len() < target.len() {
            self.mixing_buffer.resize(target.len(), 0);
        }
        let scratch = &mut self.mixing_buffer[..target.len()];

        let mut produced = 0;
        for entry in &self.sources {
            let count = lock(&entry.source).pull_audio(scratch).min(target.len());
            add_samples(&mut target[..count], &scratch[..count], self.fixed_absolute_volume, self.summing);
            produced = produced.max(count);
        }

        // Collect completion notices and release anything that finished during this pass
        let before = self.sources.len();
        let pending = &mut self.pending;
        self.sources.retain(|entry| {
            let mut source = lock(&entry.source);
            source.take_finished(pending);
            !source.can_be_destroyed()
        });
        if self.sources.len() != before {
            debug!("released {} finished source(s)", before - self.sources.len());
        }

        if self.fixed_general_volume != FIXED_ONE {
            let volume = self.fixed_general_volume;
            for sample in &mut target[..produced] {
                *sample = ((i32::from(*sample) * volume) >> FIXED_SHIFT) as i16;
            }
        }

        produced
    }
}

fn entry_id(source: &SharedSource, mixer: Option<&Mixer>) -> usize {
    match mixer {
        Some(mixer) => Arc::as_ptr(&mixer.shared) as usize,
        None => source_addr(source) as usize,
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Mixer")
            .field("sources", &state.sources.len())
            .field("absolute_volume", &from_fixed_gain(state.fixed_absolute_volume))
            .field("general_volume", &from_fixed_gain(state.fixed_general_volume))
            .field("summing", &state.summing)
            .field("output_rate", &state.output_rate)
            .finish()
    }
}

impl AudioSource for Mixer {
    fn pull_audio(&mut self, target: &mut [i16]) -> usize {
        // Notices stay pending until whoever pulls this mixer collects them
        lock(&self.shared.state).mix(target)
    }

    fn as_mixer(&self) -> Option<&Mixer> {
        Some(self)
    }

    fn set_output_rate(&mut self, rate: u32) {
        Mixer::set_output_rate(self, rate);
    }

    fn take_finished(&mut self, notices: &mut Vec<FinishedNotice>) {
        notices.append(&mut lock(&self.shared.state).pending);
    }
}

fn add_samples(target: &mut [i16], input: &[i16], volume: i32, summing: SummingMode) {
    for (out_sample, &in_sample) in target.iter_mut().zip(input) {
        let scaled = if volume == FIXED_ONE {
            in_sample
        } else {
            ((i32::from(in_sample) * volume) >> FIXED_SHIFT) as i16
        };
        *out_sample = match summing {
            SummingMode::Wrapping => out_sample.wrapping_add(scaled),
            SummingMode::Saturating => out_sample.saturating_add(scaled),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AudioFormat, SampleBuffer, SourcePlayback};

    /// Writes `value` into every slot, up to `limit` samples per pull.
    struct Constant {
        value: i16,
        limit: usize,
        done: bool,
    }

    impl Constant {
        fn shared(value: i16, limit: usize) -> Arc<Mutex<Constant>> {
            Arc::new(Mutex::new(Constant { value, limit, done: false }))
        }
    }

    impl AudioSource for Constant {
        fn pull_audio(&mut self, target: &mut [i16]) -> usize {
            let count = target.len().min(self.limit);
            target[..count].iter_mut().for_each(|s| *s = self.value);
            count
        }

        fn can_be_destroyed(&self) -> bool {
            self.done
        }
    }

    #[test]
    fn empty_mixer_is_silent() {
        let mixer = Mixer::new();
        let mut target = [5i16; 8];
        assert_eq!(mixer.mix(&mut target), 0);
        assert_eq!(target, [0; 8]);
    }

    #[test]
    fn rejects_duplicates() {
        let mixer = Mixer::new();
        let source: SharedSource = Constant::shared(1, usize::MAX);
        assert!(mixer.add_source(source.clone()));
        assert!(!mixer.add_source(source.clone()));
        assert_eq!(mixer.audio_source_count(), 1);

        assert!(mixer.remove_source(&source));
        assert!(!mixer.remove_source(&source));
        assert_eq!(mixer.audio_source_count(), 0);
    }

    #[test]
    fn removal_does_not_destroy() {
        let mixer = Mixer::new();
        let constant = Constant::shared(9, usize::MAX);
        let source: SharedSource = constant.clone();
        mixer.add_source(source.clone());
        mixer.remove_source(&source);
        assert_eq!(lock(&constant).pull_audio(&mut [0i16; 2]), 2);
    }

    #[test]
    fn sums_sources_and_reports_longest() {
        let mixer = Mixer::new();
        mixer.add_source(Constant::shared(100, 4));
        mixer.add_source(Constant::shared(10, 8));

        let mut target = [0i16; 10];
        assert_eq!(mixer.mix(&mut target), 8);
        assert_eq!(target, [110, 110, 110, 110, 10, 10, 10, 10, 0, 0]);
    }

    #[test]
    fn wraps_on_overflow_by_default() {
        let mixer = Mixer::new();
        mixer.add_source(Constant::shared(30_000, usize::MAX));
        mixer.add_source(Constant::shared(30_000, usize::MAX));

        let mut target = [0i16; 2];
        mixer.mix(&mut target);
        assert_eq!(target[0], 30_000i16.wrapping_add(30_000));
        assert!(target[0] < 0);
    }

    #[test]
    fn saturates_when_asked() {
        let mixer = Mixer::with_summing(SummingMode::Saturating);
        mixer.add_source(Constant::shared(30_000, usize::MAX));
        mixer.add_source(Constant::shared(30_000, usize::MAX));
        mixer.add_source(Constant::shared(-100, usize::MAX));

        let mut target = [0i16; 2];
        mixer.mix(&mut target);
        assert_eq!(target, [i16::MAX - 100; 2]);
    }

    #[test]
    fn releases_finished_sources_after_pull() {
        let mixer = Mixer::new();
        let finished = Constant::shared(1, usize::MAX);
        mixer.add_source(finished.clone());
        mixer.add_source(Constant::shared(2, usize::MAX));

        lock(&finished).done = true;
        assert_eq!(mixer.audio_source_count(), 2);

        let mut target = [0i16; 4];
        mixer.mix(&mut target);
        // It still contributed to the pull that released it
        assert_eq!(target, [3; 4]);
        assert_eq!(mixer.audio_source_count(), 1);
        assert_eq!(Arc::strong_count(&finished), 1);
    }

    #[test]
    fn volumes_scale_output() {
        let mixer = Mixer::new();
        mixer.add_source(Constant::shared(1000, usize::MAX));

        mixer.set_general_volume(0.5);
        let mut target = [0i16; 2];
        mixer.mix(&mut target);
        assert_eq!(target, [500; 2]);

        mixer.set_absolute_volume(0.5);
        mixer.mix(&mut target);
        assert_eq!(target, [250; 2]);

        assert_eq!(mixer.general_volume(), 0.5);
        assert_eq!(mixer.absolute_volume(), 0.5);
    }

    #[test]
    fn volume_change_notifies_only_on_change() {
        let mixer = Mixer::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        mixer.on_volume_changed(move |change| lock(&sink).push(change));

        mixer.set_general_volume(1.0);
        mixer.set_general_volume(0.25);
        mixer.set_general_volume(0.25);
        mixer.set_absolute_volume(2.0);
        mixer.set_absolute_volume(0.0);

        assert_eq!(*lock(&seen), vec![VolumeChange::General(0.25), VolumeChange::Absolute(0.0)]);
    }

    #[test]
    fn mixers_nest() {
        let parent = Mixer::new();
        let child = Mixer::new();
        child.add_source(Constant::shared(7, usize::MAX));
        assert!(parent.add_source(child.shared()));
        parent.add_source(Constant::shared(1, usize::MAX));

        let mut target = [0i16; 4];
        assert_eq!(parent.mix(&mut target), 4);
        assert_eq!(target, [8; 4]);
    }

    #[test]
    fn refuses_itself() {
        let mixer = Mixer::new();
        assert!(!mixer.add_source(mixer.shared()));
        assert_eq!(mixer.audio_source_count(), 0);
    }

    #[test]
    fn refuses_cycles_through_sub_mixers() {
        let a = Mixer::new();
        let b = Mixer::new();
        let c = Mixer::new();
        assert!(a.add_source(b.shared()));
        assert!(b.add_source(c.shared()));

        assert!(!b.add_source(a.shared()));
        assert!(!c.add_source(a.shared()));
        assert!(!c.add_source(b.shared()));
        assert_eq!(b.audio_source_count(), 1);
        assert_eq!(c.audio_source_count(), 0);

        // Still mixable afterwards
        c.add_source(Constant::shared(3, usize::MAX));
        let mut target = [0i16; 2];
        assert_eq!(a.mix(&mut target), 2);
        assert_eq!(target, [3; 2]);
    }

    #[test]
    fn separate_wrappers_of_one_mixer_are_duplicates() {
        let parent = Mixer::new();
        let child = Mixer::new();
        child.add_source(Constant::shared(5, usize::MAX));

        assert!(parent.add_source(child.shared()));
        assert!(!parent.add_source(child.shared()));
        assert_eq!(parent.audio_source_count(), 1);

        let mut target = [0i16; 2];
        parent.mix(&mut target);
        assert_eq!(target, [5; 2]);

        assert!(parent.remove_source(&child.shared()));
        assert_eq!(parent.audio_source_count(), 0);
    }

    fn buffer(rate: u32) -> Arc<SampleBuffer> {
        Arc::new(SampleBuffer::from_pcm(AudioFormat::new(1, 16, rate), vec![0u8; 20]).unwrap())
    }

    #[test]
    fn output_rate_reaches_registered_sources() {
        let root = Mixer::new();
        let child = Mixer::new();
        root.add_source(child.shared());

        let early = SourcePlayback::play_with_mixer(buffer(44_100), &child).unwrap();
        assert_eq!(lock(&early).rate_increment(), 2 * i64::from(FIXED_ONE));

        root.set_output_rate(44_100);
        assert_eq!(child.output_rate(), 44_100);
        assert_eq!(lock(&early).rate_increment(), i64::from(FIXED_ONE));

        let late = SourcePlayback::play_with_mixer(buffer(22_050), &child).unwrap();
        assert_eq!(lock(&late).rate_increment(), i64::from(FIXED_ONE) / 2);
    }

    #[test]
    fn finished_callback_may_register_sources() {
        let mixer = Mixer::new();
        let playback = SourcePlayback::play_with_mixer(buffer(22_050), &mixer).unwrap();
        let handle = mixer.clone();
        lock(&playback).on_finished(move || {
            handle.add_source(Constant::shared(4, usize::MAX));
        });

        // 10 frames minus the guard frames finish inside this pull
        let mut target = [0i16; 32];
        assert_eq!(mixer.mix(&mut target), 16);
        assert_eq!(mixer.audio_source_count(), 1);

        mixer.mix(&mut target);
        assert_eq!(target, [4; 32]);
    }

    #[test]
    fn nested_notices_reach_the_outer_mix() {
        let root = Mixer::new();
        let child = Mixer::new();
        root.add_source(child.shared());

        let playback = SourcePlayback::play_with_mixer(buffer(22_050), &child).unwrap();
        let handle = child.clone();
        lock(&playback).on_finished(move || {
            handle.add_source(Constant::shared(6, usize::MAX));
        });

        root.mix(&mut [0i16; 32]);
        assert_eq!(child.audio_source_count(), 1);
    }

    #[test]
    fn dropping_the_last_handle_releases_sources() {
        let constant = Constant::shared(1, usize::MAX);
        {
            let mixer = Mixer::new();
            mixer.add_source(constant.clone());
            let other = mixer.clone();
            drop(mixer);
            assert_eq!(other.audio_source_count(), 1);
            assert_eq!(Arc::strong_count(&constant), 2);
        }
        assert_eq!(Arc::strong_count(&constant), 1);
    }

    #[test]
    fn destroy_list_clears() {
        let mixer = Mixer::new();
        let kept = Constant::shared(1, usize::MAX);
        mixer.add_source(kept.clone());
        for _ in 0..2 {
            mixer.add_source(Constant::shared(1, usize::MAX));
        }
        assert_eq!(mixer.audio_source_count(), 3);

        mixer.destroy_list();
        assert_eq!(mixer.audio_source_count(), 0);
        assert_eq!(Arc::strong_count(&kept), 1);
        assert_eq!(mixer.mix(&mut [0i16; 4]), 0);
    }
}
