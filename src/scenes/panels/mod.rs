//! Panel call-sites: the concrete widget layouts that wire controls to
//! authorities and spawn popups. A panel exclusively owns the popup it
//! spawned; at most one interactive popup is active per panel at a time.
use std::time::Duration;

use bevy::prelude::*;

use crate::{
    systems::{
        authority::{
            environment_presets, AvailabilityProbe, BoundProperty, CommandBinding, PanelKind,
            PanelVisibility, SketchAction, StateProbe, Tool, ViewMode,
        },
        colors::{ControlPalette, DANGER_COLOR, PANEL_BACKGROUND, POPUP_BACKGROUND, PRIMARY_COLOR},
        fetch::{FetchError, FetchHandle, FetchPlugin, FetchRuntime, FetchState, SketchFetch},
        interaction::{
            AuthorityFeed, Control, ControlCaption, ControlKind, InteractionSystem,
            LongPressBehavior, MirrorSource, MultistateBehavior, SliderBehavior, SliderNob,
            ToggleBehavior,
        },
        ui::popup::{
            PagingGrid, PagingNavButton, PagingSlot, Popup, PopupCloseRequest, PopupClosed,
            PopupConfirmButton, PopupDismissButton, PopupKind, PopupPaging, PopupPlugin,
            PopupSystem,
        },
    },
};

pub struct PanelsPlugin;

impl Plugin for PanelsPlugin {
    fn build(&self, app: &mut App) {
        if !app.is_plugin_added::<PopupPlugin>() {
            app.add_plugins(PopupPlugin);
        }
        if !app.is_plugin_added::<FetchPlugin>() {
            app.add_plugins(FetchPlugin);
        }
        app.add_systems(Startup, spawn_panels).add_systems(
            Update,
            (
                open_popup_requests.after(InteractionSystem::Press),
                handle_popup_closed.after(PopupSystem::Lifecycle),
                sync_panel_visibility.after(InteractionSystem::Mirror),
                poll_download_fetch.before(PopupSystem::Lifecycle),
            ),
        );
    }
}

/// Root of one floating panel. `active_popup` is the exclusive slot for the
/// popup this panel spawned, invalidated when that popup reports Closed.
#[derive(Component)]
#[require(Transform, Visibility)]
pub struct Panel {
    pub kind: PanelKind,
    pub active_popup: Option<Entity>,
}

impl Panel {
    pub fn new(kind: PanelKind) -> Self {
        Self {
            kind,
            active_popup: None,
        }
    }
}

/// The "open downloaded sketch" button inside a download popup; flips
/// available only when its fetch completes.
#[derive(Component, Clone, Copy)]
pub struct DownloadOpenButton {
    pub popup: Entity,
}

/// Percentage readout inside a download popup.
#[derive(Component, Clone, Copy)]
pub struct DownloadProgressLabel {
    pub popup: Entity,
}

const BUTTON_SIZE: Vec2 = Vec2::new(120.0, 30.0);
const ROW_STEP: f32 = 42.0;

/* ─────────────────────────  LAYOUT  ───────────────────────── */

fn spawn_caption(commands: &mut Commands, text: &str, offset: Vec3) -> Entity {
    commands
        .spawn((
            Text2d::new(text),
            TextFont {
                font_size: 14.0,
                ..default()
            },
            TextColor(Color::BLACK),
            Transform::from_translation(offset),
            ControlCaption,
        ))
        .id()
}

fn spawn_button(
    commands: &mut Commands,
    parent: Entity,
    control: Control,
    caption: &str,
    position: Vec3,
) -> Entity {
    let caption = spawn_caption(commands, caption, Vec3::new(0.0, 0.0, 0.1));
    let button = commands
        .spawn((
            control,
            Sprite::from_color(PRIMARY_COLOR, BUTTON_SIZE),
            Transform::from_translation(position),
        ))
        .id();
    commands.entity(button).add_child(caption);
    commands.entity(parent).add_child(button);
    button
}

fn spawn_slider(
    commands: &mut Commands,
    parent: Entity,
    behavior: SliderBehavior,
    label: &str,
    position: Vec3,
) -> Entity {
    let track_width = behavior.track_width;
    let slider = commands
        .spawn((
            Control::new(
                ControlKind::Slider(behavior),
                CommandBinding::new(SketchAction::SelectEnvironment),
                Vec2::new(track_width, 26.0),
            ),
            Sprite::from_color(PRIMARY_COLOR, Vec2::new(track_width, 6.0)),
            Transform::from_translation(position),
        ))
        .id();
    let nob = commands
        .spawn((
            SliderNob,
            Sprite::from_color(PRIMARY_COLOR, Vec2::new(10.0, 22.0)),
            Transform::from_xyz(0.0, 0.0, 0.2),
        ))
        .id();
    let label = commands
        .spawn((
            Text2d::new(label),
            TextFont {
                font_size: 12.0,
                ..default()
            },
            TextColor(PRIMARY_COLOR),
            Transform::from_xyz(0.0, 20.0, 0.1),
        ))
        .id();
    commands.entity(slider).add_child(nob);
    commands.entity(slider).add_child(label);
    commands.entity(parent).add_child(slider);
    slider
}

fn spawn_panels(mut commands: Commands, view_mode: Res<ViewMode>) {
    /* tools panel */
    let tools = commands
        .spawn((
            Name::new("tools_panel"),
            Panel::new(PanelKind::Tools),
            Sprite::from_color(PANEL_BACKGROUND, Vec2::new(240.0, 420.0)),
            Transform::from_xyz(-420.0, 0.0, 1.0),
        ))
        .id();

    let mut row = 0;
    for (tool, label) in [
        (Tool::Brush, "Brush"),
        (Tool::Eraser, "Eraser"),
        (Tool::Fill, "Fill"),
        (Tool::Grab, "Grab"),
    ] {
        spawn_button(
            &mut commands,
            tools,
            Control::new(
                ControlKind::Toggle(ToggleBehavior::new(StateProbe::ToolIs(tool))),
                CommandBinding::with_param(SketchAction::SelectTool, tool.to_param()),
                BUTTON_SIZE,
            ),
            label,
            row_position(&mut row),
        );
    }

    spawn_button(
        &mut commands,
        tools,
        Control::new(
            ControlKind::Toggle(
                ToggleBehavior::new(StateProbe::MusicPlaying).with_captions("Play", "Pause"),
            ),
            CommandBinding::new(SketchAction::ToggleMusic),
            BUTTON_SIZE,
        ),
        "Play",
        row_position(&mut row),
    );

    let view_button = spawn_button(
        &mut commands,
        tools,
        Control::new(
            ControlKind::Multistate(MultistateBehavior::new(
                ViewMode::LABELS.map(str::to_string),
                Some(MirrorSource::ViewMode),
            )),
            CommandBinding::new(SketchAction::AdvanceViewMode),
            BUTTON_SIZE,
        ),
        ViewMode::LABELS[0],
        row_position(&mut row),
    );
    commands
        .entity(view_button)
        .insert(AuthorityFeed(view_mode.notifier.subscribe()));

    spawn_button(
        &mut commands,
        tools,
        Control::new(
            ControlKind::Multistate(MultistateBehavior::new(
                ["Wheel", "Sliders", "Palette"].map(str::to_string),
                None,
            )),
            CommandBinding::new(SketchAction::SelectColorMode),
            BUTTON_SIZE,
        ),
        "Wheel",
        row_position(&mut row),
    );

    spawn_button(
        &mut commands,
        tools,
        Control::new(
            ControlKind::Toggle(ToggleBehavior::new(StateProbe::SyncEnabled)),
            CommandBinding::new(SketchAction::ToggleDriveSync),
            BUTTON_SIZE,
        )
        .with_availability(AvailabilityProbe::SyncSignedIn),
        "Drive sync",
        row_position(&mut row),
    );

    spawn_button(
        &mut commands,
        tools,
        Control::new(
            ControlKind::Toggle(ToggleBehavior::new(StateProbe::PanelOpen(
                PanelKind::Sketchbook,
            ))),
            CommandBinding::with_param(SketchAction::TogglePanel, PanelKind::Sketchbook.to_param()),
            BUTTON_SIZE,
        ),
        "Sketchbook",
        row_position(&mut row),
    );

    /* lights panel */
    let lights = commands
        .spawn((
            Name::new("lights_panel"),
            Panel::new(PanelKind::Lights),
            Sprite::from_color(PANEL_BACKGROUND, Vec2::new(280.0, 420.0)),
            Transform::from_xyz(0.0, 0.0, 1.0),
        ))
        .id();

    let mut row = 0;
    for (index, preset) in environment_presets().iter().enumerate() {
        spawn_button(
            &mut commands,
            lights,
            Control::new(
                ControlKind::Toggle(ToggleBehavior::new(StateProbe::EnvironmentPresetIs(index))),
                CommandBinding::with_param(SketchAction::SelectEnvironment, index as i32),
                BUTTON_SIZE,
            ),
            &preset.name,
            row_position(&mut row),
        );
    }

    spawn_slider(
        &mut commands,
        lights,
        SliderBehavior::new(BoundProperty::LampIntensity, (0.0, 1.0), 1.0, 180.0).undoable(),
        "Lamp",
        row_position(&mut row),
    );
    // Fog reads better on an exponential ramp, so the nob travels a power
    // curve rather than the raw density.
    spawn_slider(
        &mut commands,
        lights,
        SliderBehavior::new(BoundProperty::FogDensity, (0.0, 0.5), 2.0, 180.0).undoable(),
        "Fog",
        row_position(&mut row),
    );
    spawn_slider(
        &mut commands,
        lights,
        SliderBehavior::new(BoundProperty::MusicVolume, (0.0, 1.0), 1.0, 180.0),
        "Volume",
        row_position(&mut row),
    );

    /* sketchbook panel */
    let sketchbook = commands
        .spawn((
            Name::new("sketchbook_panel"),
            Panel::new(PanelKind::Sketchbook),
            Sprite::from_color(PANEL_BACKGROUND, Vec2::new(240.0, 420.0)),
            Transform::from_xyz(420.0, 0.0, 1.0),
        ))
        .id();

    let mut row = 0;
    spawn_button(
        &mut commands,
        sketchbook,
        Control::new(
            ControlKind::Momentary,
            CommandBinding::new(SketchAction::Undo),
            BUTTON_SIZE,
        )
        .with_availability(AvailabilityProbe::UndoAvailable),
        "Undo",
        row_position(&mut row),
    );
    // Quick tap loads the latest sketch; holding deletes it instead.
    spawn_button(
        &mut commands,
        sketchbook,
        Control::new(
            ControlKind::LongPress(LongPressBehavior {
                threshold: 0.6,
                long: CommandBinding::with_param(SketchAction::DeleteSketch, 0),
            }),
            CommandBinding::with_param(SketchAction::LoadSketch, 0),
            BUTTON_SIZE,
        ),
        "Latest sketch",
        row_position(&mut row),
    );
    spawn_button(
        &mut commands,
        sketchbook,
        Control::new(
            ControlKind::Momentary,
            CommandBinding::with_param(SketchAction::LoadSketch, 0),
            BUTTON_SIZE,
        )
        .with_popup(PopupKind::Sketchbook),
        "Browse",
        row_position(&mut row),
    );
    spawn_button(
        &mut commands,
        sketchbook,
        Control::new(
            ControlKind::Momentary,
            CommandBinding::with_param(SketchAction::LoadSketch, 0),
            BUTTON_SIZE,
        )
        .with_popup(PopupKind::SketchOptions),
        "Options",
        row_position(&mut row),
    );
    spawn_button(
        &mut commands,
        sketchbook,
        Control::new(
            ControlKind::Momentary,
            CommandBinding::with_param(SketchAction::UploadSketch, 0),
            BUTTON_SIZE,
        )
        .with_popup(PopupKind::UploadConfirm)
        .with_availability(AvailabilityProbe::SyncSignedIn),
        "Upload",
        row_position(&mut row),
    );
    spawn_button(
        &mut commands,
        sketchbook,
        Control::new(
            ControlKind::Momentary,
            CommandBinding::with_param(SketchAction::LoadSketch, 0),
            BUTTON_SIZE,
        )
        .with_popup(PopupKind::DownloadSketch)
        .with_availability(AvailabilityProbe::MemoryNotCritical),
        "Download",
        row_position(&mut row),
    );
}

fn row_position(row: &mut i32) -> Vec3 {
    let position = Vec3::new(0.0, 170.0 - *row as f32 * ROW_STEP, 0.5);
    *row += 1;
    position
}

/* ─────────────────────────  POPUP SPAWNING  ───────────────────────── */

/// Opens the popup a pressed control asked for, unless its panel already has
/// one active.
pub fn open_popup_requests(
    mut commands: Commands,
    runtime: Res<FetchRuntime>,
    controls: Query<(Entity, &Control)>,
    mut panels: Query<&mut Panel>,
    parents: Query<&ChildOf>,
) {
    for (entity, control) in controls.iter() {
        if !control.popup_fired {
            continue;
        }
        let Some(kind) = control.popup else {
            continue;
        };

        let mut current = entity;
        let panel_entity = loop {
            let Ok(child_of) = parents.get(current) else {
                break None;
            };
            let parent = child_of.parent();
            if panels.contains(parent) {
                break Some(parent);
            }
            current = parent;
        };
        let Some(panel_entity) = panel_entity else {
            log::warn!("popup requested by a control outside any panel");
            continue;
        };
        let Ok(mut panel) = panels.get_mut(panel_entity) else {
            continue;
        };
        if panel.active_popup.is_some() {
            continue;
        }

        let popup = spawn_popup(&mut commands, &runtime, kind, panel_entity, control.binding);
        panel.active_popup = Some(popup);
    }
}

fn popup_root(
    commands: &mut Commands,
    popup: Popup,
    name: &'static str,
    position: Vec3,
) -> Entity {
    let region = popup.region;
    commands
        .spawn((
            Name::new(name),
            popup,
            Sprite::from_color(POPUP_BACKGROUND, region),
            Transform::from_translation(position),
        ))
        .id()
}

fn spawn_popup(
    commands: &mut Commands,
    runtime: &FetchRuntime,
    kind: PopupKind,
    panel: Entity,
    binding: CommandBinding,
) -> Entity {
    match kind {
        PopupKind::UploadConfirm => {
            let popup = popup_root(
                commands,
                Popup::new(kind, panel)
                    .with_params(binding.param, binding.param2)
                    .blocking_undo_redo(),
                "upload_confirm_popup",
                Vec3::new(420.0, 0.0, 50.0),
            );
            let title = spawn_caption(commands, "Upload sketch?", Vec3::new(0.0, 45.0, 0.1));
            commands.entity(title).remove::<ControlCaption>();
            commands.entity(popup).add_child(title);

            let confirm = spawn_button(
                commands,
                popup,
                Control::new(
                    ControlKind::Momentary,
                    CommandBinding::new(SketchAction::UploadSketch),
                    BUTTON_SIZE,
                ),
                "Upload",
                Vec3::new(-50.0, -30.0, 0.5),
            );
            commands.entity(confirm).insert(PopupConfirmButton { popup });
            let cancel = spawn_button(
                commands,
                popup,
                Control::new(
                    ControlKind::Momentary,
                    CommandBinding::new(SketchAction::UploadSketch),
                    BUTTON_SIZE,
                ),
                "Cancel",
                Vec3::new(50.0, -30.0, 0.5),
            );
            commands.entity(cancel).insert(PopupDismissButton { popup });
            popup
        }
        PopupKind::SketchOptions => {
            // Held open by the press that spawned it; releasing the ray
            // closes it without further input.
            let popup = popup_root(
                commands,
                Popup::new(kind, panel)
                    .with_params(binding.param, binding.param2)
                    .long_press(),
                "sketch_options_popup",
                Vec3::new(420.0, 80.0, 50.0),
            );
            spawn_button(
                commands,
                popup,
                Control::new(
                    ControlKind::Momentary,
                    CommandBinding::new(SketchAction::LoadSketch),
                    BUTTON_SIZE,
                ),
                "Load",
                Vec3::new(0.0, 20.0, 0.5),
            );
            let delete = spawn_button(
                commands,
                popup,
                Control::new(
                    ControlKind::Momentary,
                    CommandBinding::new(SketchAction::DeleteSketch),
                    BUTTON_SIZE,
                ),
                "Delete",
                Vec3::new(0.0, -25.0, 0.5),
            );
            commands
                .entity(delete)
                .insert(ControlPalette::default().with_idle(DANGER_COLOR));
            popup
        }
        PopupKind::DownloadSketch => {
            let popup = popup_root(
                commands,
                Popup::new(kind, panel).with_params(binding.param, binding.param2),
                "download_popup",
                Vec3::new(420.0, -80.0, 50.0),
            );
            commands
                .entity(popup)
                .insert(SketchFetch::spawn(runtime, demo_remote_fetch));

            let progress = commands
                .spawn((
                    Text2d::new("0%"),
                    TextFont {
                        font_size: 16.0,
                        ..default()
                    },
                    TextColor(PRIMARY_COLOR),
                    Transform::from_xyz(0.0, 30.0, 0.1),
                    DownloadProgressLabel { popup },
                ))
                .id();
            commands.entity(popup).add_child(progress);

            let mut open_control = Control::new(
                ControlKind::Momentary,
                CommandBinding::new(SketchAction::LoadSketch),
                BUTTON_SIZE,
            )
            .with_availability(AvailabilityProbe::Manual);
            open_control.available = false;
            let open = spawn_button(
                commands,
                popup,
                open_control,
                "Open",
                Vec3::new(-50.0, -30.0, 0.5),
            );
            commands
                .entity(open)
                .insert((DownloadOpenButton { popup }, PopupConfirmButton { popup }));

            let cancel = spawn_button(
                commands,
                popup,
                Control::new(
                    ControlKind::Momentary,
                    CommandBinding::new(SketchAction::LoadSketch),
                    BUTTON_SIZE,
                ),
                "Cancel",
                Vec3::new(50.0, -30.0, 0.5),
            );
            commands.entity(cancel).insert(PopupDismissButton { popup });
            popup
        }
        PopupKind::Sketchbook => {
            let popup = popup_root(
                commands,
                Popup::new(kind, panel)
                    .with_params(binding.param, binding.param2)
                    .with_region(Vec2::new(300.0, 220.0))
                    .blocking_undo_redo(),
                "sketchbook_popup",
                Vec3::new(420.0, 0.0, 50.0),
            );
            let entries = (1..=9).map(|index| format!("Sketch {index}")).collect();
            commands
                .entity(popup)
                .insert(PopupPaging::new(entries, 4));

            let grid = commands
                .spawn((PagingGrid, Transform::from_xyz(0.0, 20.0, 0.3), Visibility::Inherited))
                .id();
            commands.entity(popup).add_child(grid);
            for index in 0..4 {
                let column = (index % 2) as f32;
                let line = (index / 2) as f32;
                let slot = spawn_button(
                    commands,
                    grid,
                    Control::new(
                        ControlKind::Momentary,
                        CommandBinding::new(SketchAction::LoadSketch),
                        BUTTON_SIZE,
                    ),
                    "",
                    Vec3::new(-70.0 + column * 140.0, 25.0 - line * 45.0, 0.2),
                );
                commands.entity(slot).insert(PagingSlot { index });
            }

            for (delta, label, x) in [(-1_isize, "<", -120.0_f32), (1, ">", 120.0)] {
                let nav = spawn_button(
                    commands,
                    popup,
                    Control::new(
                        ControlKind::Momentary,
                        CommandBinding::new(SketchAction::LoadSketch),
                        Vec2::new(30.0, 30.0),
                    ),
                    label,
                    Vec3::new(x, 20.0, 0.5),
                );
                commands.entity(nav).insert(PagingNavButton { popup, delta });
            }

            let close = spawn_button(
                commands,
                popup,
                Control::new(
                    ControlKind::Momentary,
                    CommandBinding::new(SketchAction::LoadSketch),
                    BUTTON_SIZE,
                ),
                "Close",
                Vec3::new(0.0, -85.0, 0.5),
            );
            commands.entity(close).insert(PopupDismissButton { popup });
            popup
        }
    }
}

/// Stand-in for the drive-sync transport: a chunked remote read reporting
/// fractional progress. Aborts at the first report after cancellation.
fn demo_remote_fetch(
    progress: FetchHandle,
) -> impl std::future::Future<Output = Result<(), FetchError>> + Send {
    async move {
        for step in 1..=24 {
            tokio::time::sleep(Duration::from_millis(125)).await;
            progress.report_progress(step as f32 / 24.0)?;
        }
        Ok(())
    }
}

/* ─────────────────────────  UPKEEP  ───────────────────────── */

/// Invalidates a panel's active-popup slot once that popup reports Closed.
pub fn handle_popup_closed(
    mut closed: MessageReader<PopupClosed>,
    mut panels: Query<&mut Panel>,
) {
    for message in closed.read() {
        if let Ok(mut panel) = panels.get_mut(message.panel) {
            if panel.active_popup == Some(message.popup) {
                panel.active_popup = None;
            }
        }
    }
}

/// Panels follow the panel-open authority. Dismissing a panel tears down its
/// active popup with the transition skipped, so no timer outlives the owner.
pub fn sync_panel_visibility(
    registry: Res<PanelVisibility>,
    mut panels: Query<(&mut Panel, &mut Visibility)>,
    mut close_out: MessageWriter<PopupCloseRequest>,
) {
    for (panel, mut visibility) in panels.iter_mut() {
        let panel = panel.into_inner();
        let open = registry.open.contains(&panel.kind);
        let target = if open {
            Visibility::Inherited
        } else {
            Visibility::Hidden
        };
        if *visibility != target {
            *visibility = target;
            if !open {
                if let Some(popup) = panel.active_popup.take() {
                    close_out.write(PopupCloseRequest::teardown(popup));
                }
            }
        }
    }
}

/// Reflects fetch progress onto the download popup. Once cancelled, no state
/// here ever changes again; a racing completion is reported as Cancelled and
/// the "Open" button never becomes available.
pub fn poll_download_fetch(
    fetches: Query<(Entity, &SketchFetch), With<Popup>>,
    mut open_buttons: Query<(&mut Control, &DownloadOpenButton)>,
    mut labels: Query<(&mut Text2d, &DownloadProgressLabel)>,
) {
    for (popup_entity, fetch) in fetches.iter() {
        match fetch.handle.state() {
            FetchState::Running => {
                for (mut text, label) in labels.iter_mut() {
                    if label.popup == popup_entity {
                        text.0 = format!("{:.0}%", fetch.handle.progress() * 100.0);
                    }
                }
            }
            FetchState::Complete => {
                for (mut text, label) in labels.iter_mut() {
                    if label.popup == popup_entity {
                        text.0 = "Ready".to_string();
                    }
                }
                for (mut control, button) in open_buttons.iter_mut() {
                    if button.popup == popup_entity {
                        control.available = true;
                    }
                }
            }
            FetchState::Cancelled | FetchState::Failed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        startup::pointer::GazePointer,
        systems::{interaction::InteractionPlugin, ui::popup::PopupPhase},
    };

    fn harness() -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_plugins(InteractionPlugin);
        app.add_plugins(PopupPlugin);
        app.add_plugins(FetchPlugin);
        app.add_systems(
            Update,
            (
                open_popup_requests.after(InteractionSystem::Press),
                handle_popup_closed.after(PopupSystem::Lifecycle),
                sync_panel_visibility.after(InteractionSystem::Mirror),
                poll_download_fetch.before(PopupSystem::Lifecycle),
            ),
        );
        app
    }

    fn spawn_panel_with_popup_button(app: &mut App) -> (Entity, Entity) {
        let panel = app
            .world_mut()
            .spawn((
                Panel::new(PanelKind::Sketchbook),
                Transform::default(),
                GlobalTransform::default(),
            ))
            .id();
        let button = app
            .world_mut()
            .spawn((
                Control::new(
                    ControlKind::Momentary,
                    CommandBinding::with_param(SketchAction::UploadSketch, 2),
                    Vec2::new(40.0, 40.0),
                )
                .with_popup(PopupKind::UploadConfirm),
                Transform::from_xyz(0.0, 0.0, 2.0),
                GlobalTransform::from_translation(Vec3::new(0.0, 0.0, 2.0)),
            ))
            .id();
        app.world_mut().entity_mut(panel).add_child(button);
        (panel, button)
    }

    fn click_at(app: &mut App, position: Vec2) {
        {
            let mut pointer = app.world_mut().resource_mut::<GazePointer>();
            pointer.position = Some(position);
            pointer.press_edge = true;
            pointer.release_edge = false;
            pointer.held = true;
        }
        app.update();
        {
            let mut pointer = app.world_mut().resource_mut::<GazePointer>();
            pointer.press_edge = false;
            pointer.release_edge = true;
            pointer.held = false;
        }
        app.update();
        {
            let mut pointer = app.world_mut().resource_mut::<GazePointer>();
            pointer.release_edge = false;
        }
    }

    #[test]
    fn press_spawns_popup_and_claims_the_panel_slot() {
        let mut app = harness();
        let (panel, _) = spawn_panel_with_popup_button(&mut app);

        click_at(&mut app, Vec2::ZERO);

        let active = app.world().get::<Panel>(panel).unwrap().active_popup;
        let popup_entity = active.expect("popup should be active");
        let popup = app.world().get::<Popup>(popup_entity).unwrap();
        assert_eq!(popup.parent_panel, panel);
        assert_eq!(popup.param, 2);

        // A second press cannot stack another popup on the same panel.
        click_at(&mut app, Vec2::ZERO);
        assert_eq!(
            app.world().get::<Panel>(panel).unwrap().active_popup,
            Some(popup_entity)
        );
    }

    #[test]
    fn closed_popup_releases_the_panel_slot() {
        let mut app = harness();
        let (panel, _) = spawn_panel_with_popup_button(&mut app);

        click_at(&mut app, Vec2::ZERO);
        let popup_entity = app
            .world()
            .get::<Panel>(panel)
            .unwrap()
            .active_popup
            .unwrap();

        app.world_mut()
            .resource_mut::<Messages<PopupCloseRequest>>()
            .write(PopupCloseRequest::teardown(popup_entity));
        app.update();
        app.update();

        assert!(app.world().get_entity(popup_entity).is_err());
        assert_eq!(app.world().get::<Panel>(panel).unwrap().active_popup, None);
    }

    #[test]
    fn dismissing_a_panel_tears_down_its_popup() {
        let mut app = harness();
        let (panel, _) = spawn_panel_with_popup_button(&mut app);

        click_at(&mut app, Vec2::ZERO);
        let popup_entity = app
            .world()
            .get::<Panel>(panel)
            .unwrap()
            .active_popup
            .unwrap();
        assert_eq!(
            app.world().get::<Popup>(popup_entity).unwrap().phase,
            PopupPhase::Opening
        );

        app.world_mut()
            .resource_mut::<PanelVisibility>()
            .open
            .remove(&PanelKind::Sketchbook);
        app.update();
        app.update();

        assert!(app.world().get_entity(popup_entity).is_err());
        assert_eq!(app.world().get::<Panel>(panel).unwrap().active_popup, None);
        assert_eq!(
            app.world().get::<Visibility>(panel).copied(),
            Some(Visibility::Hidden)
        );
    }

    #[test]
    fn download_open_button_arms_only_on_completion() {
        let mut app = harness();
        let panel = app
            .world_mut()
            .spawn((Panel::new(PanelKind::Sketchbook), Transform::default()))
            .id();
        let popup_entity = app
            .world_mut()
            .spawn((
                Popup::new(PopupKind::DownloadSketch, panel)
                    .with_duration(60.0)
                    .silent(),
                Transform::default(),
                GlobalTransform::default(),
            ))
            .id();
        let fetch = {
            let runtime = app.world().resource::<FetchRuntime>();
            SketchFetch::spawn(runtime, |progress| async move {
                progress.report_progress(1.0)?;
                Ok(())
            })
        };
        let handle = fetch.handle.clone();
        app.world_mut().entity_mut(popup_entity).insert(fetch);

        let mut open_control = Control::new(
            ControlKind::Momentary,
            CommandBinding::new(SketchAction::LoadSketch),
            Vec2::new(40.0, 40.0),
        )
        .with_availability(AvailabilityProbe::Manual);
        open_control.available = false;
        let open = app
            .world_mut()
            .spawn((
                open_control,
                DownloadOpenButton {
                    popup: popup_entity,
                },
                Transform::default(),
                GlobalTransform::default(),
            ))
            .id();
        app.world_mut().entity_mut(popup_entity).add_child(open);

        for _ in 0..2000 {
            if handle.state() != FetchState::Running {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(handle.state(), FetchState::Complete);

        app.update();
        assert!(app.world().get::<Control>(open).unwrap().available);
    }

    #[test]
    fn cancelled_download_never_arms_the_open_button() {
        let mut app = harness();
        let panel = app
            .world_mut()
            .spawn((Panel::new(PanelKind::Sketchbook), Transform::default()))
            .id();
        let popup_entity = app
            .world_mut()
            .spawn((
                Popup::new(PopupKind::DownloadSketch, panel)
                    .with_duration(0.0)
                    .silent(),
                Transform::default(),
                GlobalTransform::default(),
            ))
            .id();
        let fetch = {
            let runtime = app.world().resource::<FetchRuntime>();
            SketchFetch::spawn(runtime, |progress| async move {
                loop {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    progress.report_progress(0.4)?;
                }
            })
        };
        let handle = fetch.handle.clone();
        app.world_mut().entity_mut(popup_entity).insert(fetch);

        let mut open_control = Control::new(
            ControlKind::Momentary,
            CommandBinding::new(SketchAction::LoadSketch),
            Vec2::new(40.0, 40.0),
        )
        .with_availability(AvailabilityProbe::Manual);
        open_control.available = false;
        let open = app
            .world_mut()
            .spawn((
                open_control,
                DownloadOpenButton {
                    popup: popup_entity,
                },
                Transform::default(),
                GlobalTransform::default(),
            ))
            .id();

        app.update();

        // The user dismisses the popup mid-download. The despawn cancels
        // the fetch; even if the worker would have completed, the button
        // stays disarmed.
        app.world_mut()
            .resource_mut::<Messages<PopupCloseRequest>>()
            .write(PopupCloseRequest::force(popup_entity));
        app.update();
        assert!(app.world().get_entity(popup_entity).is_err());
        assert_eq!(handle.state(), FetchState::Cancelled);

        for _ in 0..5 {
            app.update();
        }
        assert!(!app.world().get::<Control>(open).unwrap().available);
    }
}
