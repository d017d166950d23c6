use bevy::prelude::*;

mod scenes;
mod startup;
mod systems;

use crate::{
    scenes::panels::PanelsPlugin,
    startup::StartupPlugin,
    systems::{audio::AudioPlugin, fetch::FetchPlugin},
};

fn main() {
    App::new()
        .add_plugins(DefaultPlugins)
        .add_plugins(EaselUiPlugin)
        .run();
}

struct EaselUiPlugin;

impl Plugin for EaselUiPlugin {
    fn build(&self, app: &mut App) {
        app.add_plugins(AudioPlugin)
            .add_plugins(FetchPlugin)
            .add_plugins(PanelsPlugin)
            .add_plugins(StartupPlugin);
    }
}
