use std::time::Duration;

use bevy::{
    audio::{PlaybackMode, Volume},
    prelude::*,
};
use enum_map::{Enum, EnumMap};

#[derive(Default, States, Debug, Clone, PartialEq, Eq, Hash)]
pub enum AudioSystemsActive {
    #[default]
    False,
    True,
}

pub struct AudioPlugin;
impl Plugin for AudioPlugin {
    fn build(&self, app: &mut App) {
        app.init_state::<AudioSystemsActive>()
            .add_systems(Update, activate_systems)
            .add_systems(
                Update,
                TransientAudio::tick.run_if(in_state(AudioSystemsActive::True)),
            );
    }
}

fn activate_systems(
    mut audio_state: ResMut<NextState<AudioSystemsActive>>,
    transient_query: Query<&TransientAudio>,
) {
    if !transient_query.is_empty() {
        audio_state.set(AudioSystemsActive::True)
    } else {
        audio_state.set(AudioSystemsActive::False)
    }
}

/// Feedback cues the interaction pipeline fires on state edges.
#[derive(Enum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiSound {
    Hover,
    Select,
    DisabledSelect,
    PopupOpen,
}

/// One-shot sound with a retrigger cooldown.
#[derive(Component, Clone)]
pub struct TransientAudio {
    source: Handle<AudioSource>,
    cooldown_timer: Timer,
    volume: f32,
}

impl TransientAudio {
    pub fn new(
        source: Handle<AudioSource>,
        cooldown_time_seconds: f32,
        volume: f32,
    ) -> TransientAudio {
        let mut cooldown_timer = Timer::from_seconds(cooldown_time_seconds, TimerMode::Once);
        cooldown_timer.tick(Duration::from_secs_f32(cooldown_time_seconds));
        TransientAudio {
            source,
            cooldown_timer,
            volume,
        }
    }

    pub fn ready(&self) -> bool {
        self.cooldown_timer.finished()
    }

    pub fn play(&mut self) -> (AudioPlayer<AudioSource>, PlaybackSettings) {
        self.cooldown_timer.reset();
        (
            AudioPlayer::<AudioSource>(self.source.clone()),
            PlaybackSettings {
                mode: PlaybackMode::Despawn,
                volume: Volume::Linear(self.volume),
                ..default()
            },
        )
    }

    pub fn tick(time: Res<Time>, mut audio_query: Query<&mut TransientAudio>) {
        for mut transient in audio_query.iter_mut() {
            transient.cooldown_timer.tick(time.delta());
        }
    }
}

/// Sound bank keyed by cue; each key owns the entities holding its
/// [`TransientAudio`] sources.
#[derive(Component)]
pub struct TransientAudioPallet(pub EnumMap<UiSound, Vec<Entity>>);

impl TransientAudioPallet {
    pub fn play(
        commands: &mut Commands,
        pallet: &TransientAudioPallet,
        key: UiSound,
        audio_query: &mut Query<&mut TransientAudio>,
    ) {
        for &entity in &pallet.0[key] {
            let Ok(mut transient) = audio_query.get_mut(entity) else {
                continue;
            };
            if transient.ready() {
                commands.spawn(transient.play());
            }
        }
    }
}
