pub mod pointer;
pub mod render;

use bevy::prelude::*;
use enum_map::enum_map;

use crate::systems::{
    audio::{TransientAudio, TransientAudioPallet, UiSound},
    interaction::InteractionSystem,
};

pub struct StartupPlugin;

impl Plugin for StartupPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<pointer::GazePointer>()
            .add_systems(Startup, (render::setup_camera, spawn_ui_sound_bank))
            .add_systems(
                Update,
                pointer::sample_gaze_pointer.before(InteractionSystem::Hover),
            );
    }
}

fn spawn_ui_sound_bank(mut commands: Commands, asset_server: Res<AssetServer>) {
    let hover = commands
        .spawn(TransientAudio::new(
            asset_server.load("audio/ui_hover.ogg"),
            0.1,
            0.4,
        ))
        .id();
    let select = commands
        .spawn(TransientAudio::new(
            asset_server.load("audio/ui_select.ogg"),
            0.05,
            0.8,
        ))
        .id();
    let disabled = commands
        .spawn(TransientAudio::new(
            asset_server.load("audio/ui_disabled.ogg"),
            0.2,
            0.5,
        ))
        .id();
    let popup_open = commands
        .spawn(TransientAudio::new(
            asset_server.load("audio/popup_open.ogg"),
            0.1,
            0.7,
        ))
        .id();

    commands.spawn((
        Name::new("ui_sound_bank"),
        TransientAudioPallet(enum_map! {
            UiSound::Hover => vec![hover],
            UiSound::Select => vec![select],
            UiSound::DisabledSelect => vec![disabled],
            UiSound::PopupOpen => vec![popup_open],
        }),
    ));
}
