use bevy::{prelude::*, window::PrimaryWindow};

use super::render::MainCamera;

/// The per-frame input sample every control consumes: where the gaze ray
/// lands in world space (or `None` while invalid) plus the press edges. On
/// desktop the mouse stands in for the headset's pointing ray.
#[derive(Resource, Default, Debug, Clone, Copy)]
pub struct GazePointer {
    pub position: Option<Vec2>,
    pub press_edge: bool,
    pub release_edge: bool,
    pub held: bool,
}

pub fn sample_gaze_pointer(
    window: Single<&Window, With<PrimaryWindow>>,
    camera_query: Single<(&Camera, &GlobalTransform), With<MainCamera>>,
    mouse: Res<ButtonInput<MouseButton>>,
    mut pointer: ResMut<GazePointer>,
) {
    let (camera, camera_transform) = *camera_query;
    pointer.press_edge = mouse.just_pressed(MouseButton::Left);
    pointer.release_edge = mouse.just_released(MouseButton::Left);
    pointer.held = mouse.pressed(MouseButton::Left);
    pointer.position = window
        .cursor_position()
        .and_then(|screen| camera.viewport_to_world_2d(camera_transform, screen).ok());
}
