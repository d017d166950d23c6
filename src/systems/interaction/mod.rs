//! The interactive-control state machine shared by every pressable widget.
//!
//! Behavioral truth for hover/press/toggle/availability lives on [`Control`];
//! visual-state components are downstream presentation outputs and must not
//! be read back as behavior state. One control entity covers all five widget
//! shapes (momentary, toggle, long-press, multistate, slider) through
//! [`ControlKind`], dispatched by pattern match rather than an override
//! chain.
use bevy::prelude::*;
use smallvec::SmallVec;

use crate::{
    startup::pointer::GazePointer,
    systems::{
        audio::{TransientAudio, TransientAudioPallet, UiSound},
        authority::{
            probe_availability, probe_state, read_property, write_property, AuthorityPlugin,
            AuthoritySystem, AvailabilityProbe, BoundProperty, ColorMode, CommandBinding,
            DriveSync, Environment, MemoryPressure, MusicPlayback, PanelVisibility, SketchCommand,
            SketchMemory, SliderCommit, StateProbe, ToolSelection, UndoRedoGate, ViewMode,
        },
        colors::{dim_unavailable, ControlPalette},
        ui::popup::{
            PagingNavButton, Popup, PopupConfirmButton, PopupDismissButton, PopupKind, PopupPhase,
        },
    },
};

#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum InteractionSystem {
    Hover,
    Press,
    Triggers,
    Drag,
    Mirror,
    Visuals,
    Audio,
}

pub struct InteractionPlugin;

impl Plugin for InteractionPlugin {
    fn build(&self, app: &mut App) {
        if !app.is_plugin_added::<AuthorityPlugin>() {
            app.add_plugins(AuthorityPlugin);
        }
        app.init_resource::<GazePointer>()
            .configure_sets(
                Update,
                (
                    InteractionSystem::Hover,
                    InteractionSystem::Press,
                    InteractionSystem::Triggers,
                    InteractionSystem::Drag,
                    InteractionSystem::Mirror,
                    InteractionSystem::Visuals,
                    InteractionSystem::Audio,
                )
                    .chain(),
            )
            .configure_sets(
                Update,
                AuthoritySystem::ApplyCommands
                    .after(InteractionSystem::Drag)
                    .before(InteractionSystem::Mirror),
            )
            .add_systems(
                Update,
                (
                    hover_controls.in_set(InteractionSystem::Hover),
                    control_input.in_set(InteractionSystem::Press),
                    trigger_commands.in_set(InteractionSystem::Triggers),
                    slider_drag.in_set(InteractionSystem::Drag),
                    mirror_authorities.in_set(InteractionSystem::Mirror),
                    apply_control_visuals.in_set(InteractionSystem::Visuals),
                    control_feedback_audio.in_set(InteractionSystem::Audio),
                ),
            );
    }
}

/* ─────────────────────────  DATA  ───────────────────────── */

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PressState {
    #[default]
    Idle,
    Hovering,
    Pressed,
    LongPressHeld,
}

#[derive(Clone, Debug)]
pub struct ToggleBehavior {
    /// Authority predicate recomputed every frame; never cached across frames.
    pub probe: StateProbe,
    pub active_caption: Option<&'static str>,
    pub base_caption: Option<&'static str>,
}

impl ToggleBehavior {
    pub fn new(probe: StateProbe) -> Self {
        Self {
            probe,
            active_caption: None,
            base_caption: None,
        }
    }

    pub fn with_captions(mut self, base: &'static str, active: &'static str) -> Self {
        self.base_caption = Some(base);
        self.active_caption = Some(active);
        self
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LongPressBehavior {
    /// Seconds of hold after which the long action fires in place of the
    /// short one.
    pub threshold: f32,
    pub long: CommandBinding,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorSource {
    ViewMode,
    ColorMode,
}

#[derive(Clone, Debug)]
pub struct MultistateBehavior {
    pub options: SmallVec<[String; 4]>,
    pub selected: usize,
    /// `Some` mirrors a shared mode authority: presses emit an advance
    /// command and the displayed selection follows the authority's change
    /// notification, never optimistically. `None` advances locally.
    pub mirror: Option<MirrorSource>,
    last_shown: Option<usize>,
}

impl MultistateBehavior {
    pub fn new(options: impl IntoIterator<Item = String>, mirror: Option<MirrorSource>) -> Self {
        Self {
            options: options.into_iter().collect(),
            selected: 0,
            mirror,
            last_shown: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SliderBehavior {
    pub target: BoundProperty,
    pub range: (f32, f32),
    /// Power curve exponent; 1.0 is linear. The mapped domain value is
    /// `lerp(lo, hi, value^(1/power))`.
    pub power: f32,
    pub value: f32,
    pub track_width: f32,
    pub undoable: bool,
    pub dragging: bool,
    drag_start: Option<f32>,
}

impl SliderBehavior {
    pub fn new(target: BoundProperty, range: (f32, f32), power: f32, track_width: f32) -> Self {
        Self {
            target,
            range,
            power,
            value: 0.0,
            track_width,
            undoable: false,
            dragging: false,
            drag_start: None,
        }
    }

    pub fn undoable(mut self) -> Self {
        self.undoable = true;
        self
    }
}

#[derive(Clone, Debug)]
pub enum ControlKind {
    Momentary,
    Toggle(ToggleBehavior),
    LongPress(LongPressBehavior),
    Multistate(MultistateBehavior),
    Slider(SliderBehavior),
}

/// Outcome of one press-machine step. At most one command fires per
/// press/release cycle for button kinds; sliders fire only their coalesced
/// commit, handled by [`slider_drag`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PressOutcome {
    None,
    Fire(SketchCommand),
    OpenPopup(PopupKind),
}

#[derive(Component)]
#[require(Hoverable, ControlVisualState, ControlPalette, ControlBasePose, Transform, Visibility)]
pub struct Control {
    pub kind: ControlKind,
    pub press_state: PressState,
    pub available: bool,
    pub availability: AvailabilityProbe,
    /// Local-space hit region for the gaze ray.
    pub region: Vec2,
    pub binding: CommandBinding,
    /// Pressing spawns this popup instead of emitting the bound command.
    pub popup: Option<PopupKind>,
    pub toggle_active: bool,
    pub sound_on_press: bool,
    held_for: f32,
    /// One-frame latches written by the press system and consumed by the
    /// trigger/audio systems downstream in the same frame.
    pub fired: Option<SketchCommand>,
    pub popup_fired: bool,
    pub denied: bool,
}

impl Control {
    pub fn new(kind: ControlKind, binding: CommandBinding, region: Vec2) -> Self {
        Self {
            kind,
            press_state: PressState::Idle,
            available: true,
            availability: AvailabilityProbe::Always,
            region,
            binding,
            popup: None,
            toggle_active: false,
            sound_on_press: true,
            held_for: 0.0,
            fired: None,
            popup_fired: false,
            denied: false,
        }
    }

    pub fn with_availability(mut self, probe: AvailabilityProbe) -> Self {
        self.availability = probe;
        self
    }

    pub fn with_popup(mut self, popup: PopupKind) -> Self {
        self.popup = Some(popup);
        self
    }

    pub fn is_pressed(&self) -> bool {
        matches!(
            self.press_state,
            PressState::Pressed | PressState::LongPressHeld
        )
    }

    /// Press edge. Unavailable controls never enter `Pressed`; the edge is
    /// dropped here, before any state mutation.
    pub fn begin_press(&mut self) -> PressOutcome {
        if !self.available {
            return PressOutcome::None;
        }
        self.press_state = PressState::Pressed;
        self.held_for = 0.0;

        match &mut self.kind {
            ControlKind::Momentary | ControlKind::Toggle(_) => {
                if let Some(popup) = self.popup {
                    PressOutcome::OpenPopup(popup)
                } else {
                    PressOutcome::Fire(self.binding.command())
                }
            }
            ControlKind::LongPress(_) => PressOutcome::None,
            ControlKind::Multistate(multistate) => {
                if multistate.options.len() < 2 {
                    return PressOutcome::None;
                }
                if multistate.mirror.is_some() {
                    PressOutcome::Fire(self.binding.command())
                } else {
                    multistate.selected = (multistate.selected + 1) % multistate.options.len();
                    self.binding.param = multistate.selected as i32;
                    PressOutcome::Fire(self.binding.command())
                }
            }
            ControlKind::Slider(slider) => {
                slider.dragging = true;
                PressOutcome::None
            }
        }
    }

    /// Per-frame hold step while `Pressed`. Crossing the long-press
    /// threshold fires the long action at the threshold instant and moves to
    /// `LongPressHeld`, so the later release fires nothing.
    pub fn tick_held(&mut self, dt: f32) -> PressOutcome {
        if self.press_state != PressState::Pressed {
            return PressOutcome::None;
        }
        self.held_for += dt;
        if let ControlKind::LongPress(long_press) = &self.kind {
            if self.held_for >= long_press.threshold {
                self.press_state = PressState::LongPressHeld;
                return PressOutcome::Fire(long_press.long.command());
            }
        }
        PressOutcome::None
    }

    /// Release edge. The short-press action fires only if the long threshold
    /// was never crossed.
    pub fn finish_press(&mut self, ray_valid: bool) -> PressOutcome {
        let was = self.press_state;
        self.press_state = if ray_valid {
            PressState::Hovering
        } else {
            PressState::Idle
        };
        match &self.kind {
            ControlKind::LongPress(_) if was == PressState::Pressed => {
                if let Some(popup) = self.popup {
                    PressOutcome::OpenPopup(popup)
                } else {
                    PressOutcome::Fire(self.binding.command())
                }
            }
            _ => PressOutcome::None,
        }
    }

    /// Ray loss while pressed cancels the cycle without firing either
    /// action. Slider gestures are concluded by the drag system instead.
    pub fn abort_press(&mut self) {
        self.press_state = PressState::Idle;
        self.held_for = 0.0;
    }
}

/// Canonical hover truth for behavior systems. `entered` is a one-frame flag
/// for focus-gain effects (audio, z-nudge), derived from the previous frame.
#[derive(Component, Clone, Copy, Debug, Default)]
pub struct Hoverable {
    pub hovered: bool,
    pub entered: bool,
}

#[derive(Component, Clone, Copy, Debug, Default)]
pub struct ControlVisualState {
    pub hovered: bool,
    pub pressed: bool,
    pub activated: bool,
    pub available: bool,
}

/// Base transform captured on the first visual pass; hover/press nudges are
/// applied relative to it and fully reversed when the control goes idle.
#[derive(Component, Clone, Copy, Debug, Default)]
pub struct ControlBasePose {
    captured: bool,
    scale: Vec3,
    z: f32,
}

/// Marker for the text child a control rewrites on caption swaps.
#[derive(Component, Clone, Copy, Default)]
pub struct ControlCaption;

/// Marker for a slider's nob child.
#[derive(Component, Clone, Copy, Default)]
pub struct SliderNob;

const Z_ADJUST_HOVER: f32 = 0.5;
const Z_ADJUST_CLICK: f32 = 1.0;
const HOVER_SCALE: f32 = 1.1;

/* ─────────────────────────  VALUE MAPPING  ───────────────────────── */

/// Maps a normalized slider value through the configured power curve into
/// the bound property's domain: `lerp(lo, hi, value^(1/power))`.
pub fn slider_to_domain(value: f32, lo: f32, hi: f32, power: f32) -> f32 {
    lo + (hi - lo) * value.clamp(0.0, 1.0).powf(1.0 / power)
}

/// Inverse of [`slider_to_domain`]; reconstructs the normalized value from a
/// domain value.
pub fn domain_to_slider(domain: f32, lo: f32, hi: f32, power: f32) -> f32 {
    if (hi - lo).abs() <= f32::EPSILON {
        return 0.0;
    }
    ((domain - lo) / (hi - lo)).clamp(0.0, 1.0).powf(power)
}

/* ─────────────────────────  HIT TESTING  ───────────────────────── */

pub fn pointer_over_region(point: Vec2, global: &GlobalTransform, region: Vec2) -> bool {
    let transform = global.compute_transform();
    let half = region * transform.scale.truncate().abs() * 0.5;
    let delta = point - transform.translation.truncate();
    delta.x.abs() <= half.x && delta.y.abs() <= half.y
}

/* ─────────────────────────  SYSTEMS  ───────────────────────── */

/// Resolves which control the gaze ray rests on. Exactly one control may be
/// hovered per frame: the topmost hit region under the pointer, with live
/// popups occluding everything beneath them.
pub fn hover_controls(
    pointer: Res<GazePointer>,
    popup_query: Query<(&Popup, &GlobalTransform, Option<&InheritedVisibility>)>,
    mut hoverable_query: Query<(
        Entity,
        &Control,
        &GlobalTransform,
        Option<&InheritedVisibility>,
        &mut Hoverable,
    )>,
) {
    // Stash last frame's hover in `entered` until the winner is known.
    for (_, _, _, _, mut hoverable) in hoverable_query.iter_mut() {
        hoverable.entered = hoverable.hovered;
        hoverable.hovered = false;
    }

    let Some(position) = pointer.position else {
        for (_, _, _, _, mut hoverable) in hoverable_query.iter_mut() {
            hoverable.entered = false;
        }
        return;
    };

    let mut blocking_z: Option<f32> = None;
    for (popup, global, inherited_visibility) in popup_query.iter() {
        if inherited_visibility.is_some_and(|visibility| !visibility.get()) {
            continue;
        }
        if popup.phase == PopupPhase::Closed {
            continue;
        }
        if pointer_over_region(position, global, popup.region) {
            let z = global.translation().z;
            if blocking_z.is_none_or(|current| z > current) {
                blocking_z = Some(z);
            }
        }
    }

    let mut top: Option<(Entity, f32)> = None;
    for (entity, control, global, inherited_visibility, _) in hoverable_query.iter() {
        if inherited_visibility.is_some_and(|visibility| !visibility.get()) {
            continue;
        }
        if !pointer_over_region(position, global, control.region) {
            continue;
        }
        let z = global.translation().z;
        if let Some(blocking) = blocking_z {
            if z + 0.001 < blocking {
                continue;
            }
        }
        let replace = match top {
            None => true,
            Some((current_entity, current_z)) => {
                z > current_z || (z == current_z && entity.index() > current_entity.index())
            }
        };
        if replace {
            top = Some((entity, z));
        }
    }

    for (entity, _, _, _, mut hoverable) in hoverable_query.iter_mut() {
        let was_hovered = hoverable.entered;
        hoverable.hovered = top.is_some_and(|(top_entity, _)| top_entity == entity);
        hoverable.entered = hoverable.hovered && !was_hovered;
    }
}

/// Drives the press machine from the pointer's edges. One-frame command
/// latches are reset here and consumed by the trigger systems downstream.
pub fn control_input(
    pointer: Res<GazePointer>,
    time: Res<Time>,
    mut query: Query<(&mut Control, &Hoverable)>,
) {
    let dt = time.delta_secs();
    for (control, hoverable) in query.iter_mut() {
        let control = control.into_inner();
        control.fired = None;
        control.popup_fired = false;
        control.denied = false;

        if control.press_state == PressState::Idle && hoverable.hovered {
            control.press_state = PressState::Hovering;
        } else if control.press_state == PressState::Hovering && !hoverable.hovered {
            control.press_state = PressState::Idle;
        }

        if pointer.press_edge && hoverable.hovered {
            if control.available {
                let outcome = control.begin_press();
                absorb_outcome(control, outcome);
            } else {
                control.denied = true;
                log::debug!("press dropped on unavailable control");
            }
        }

        if control.press_state == PressState::Pressed {
            let outcome = control.tick_held(dt);
            absorb_outcome(control, outcome);
        }

        if pointer.release_edge && control.is_pressed() {
            let outcome = control.finish_press(hoverable.hovered);
            absorb_outcome(control, outcome);
        } else if pointer.position.is_none()
            && control.is_pressed()
            && !matches!(control.kind, ControlKind::Slider(_))
        {
            control.abort_press();
        }
    }
}

fn absorb_outcome(control: &mut Control, outcome: PressOutcome) {
    match outcome {
        PressOutcome::None => {}
        PressOutcome::Fire(command) => control.fired = Some(command),
        PressOutcome::OpenPopup(_) => control.popup_fired = true,
    }
}

/// Forwards fired commands to the authority layer. Popup-internal buttons
/// (confirm, dismiss, page navigation) are routed by the popup module
/// instead, so confirmation deferral and paging stay popup-scoped.
pub fn trigger_commands(
    query: Query<
        &Control,
        (
            Without<PopupConfirmButton>,
            Without<PopupDismissButton>,
            Without<PagingNavButton>,
        ),
    >,
    mut commands_out: MessageWriter<SketchCommand>,
) {
    for control in query.iter() {
        if let Some(command) = control.fired {
            commands_out.write(command);
        }
    }
}

/// Continuous slider tracking. While a drag is in progress the normalized
/// value follows the projected pointer position every frame; the mapped
/// domain value is written through to the bound property unless the property
/// owner is absent, which skips propagation softly for that frame. Release
/// concludes the gesture with at most one coalesced undo commit.
pub fn slider_drag(
    pointer: Res<GazePointer>,
    mut environment: ResMut<Environment>,
    mut music: ResMut<MusicPlayback>,
    mut memory: ResMut<SketchMemory>,
    mut query: Query<(&mut Control, &GlobalTransform, Option<&Children>)>,
    mut nob_query: Query<&mut Transform, With<SliderNob>>,
) {
    for (control, global, children) in query.iter_mut() {
        let ControlKind::Slider(slider) = &mut control.into_inner().kind else {
            continue;
        };

        if slider.dragging {
            if slider.drag_start.is_none() {
                slider.drag_start = read_property(slider.target, &environment, &music);
            }

            if let Some(position) = pointer.position {
                let transform = global.compute_transform();
                let scale_x = transform.scale.x.abs().max(f32::EPSILON);
                let local_x = (position.x - transform.translation.x) / scale_x;
                slider.value = (local_x / slider.track_width + 0.5).clamp(0.0, 1.0);

                let (lo, hi) = slider.range;
                let domain = slider_to_domain(slider.value, lo, hi, slider.power);
                if !write_property(slider.target, domain, &mut environment, &mut music) {
                    log::debug!(
                        "slider target {:?} absent; skipping propagation",
                        slider.target
                    );
                }
            }

            if pointer.release_edge || !pointer.held || pointer.position.is_none() {
                slider.dragging = false;
                let (lo, hi) = slider.range;
                let committed = slider_to_domain(slider.value, lo, hi, slider.power);
                let previous = slider.drag_start.take();
                if slider.undoable {
                    if let Some(previous) = previous {
                        if (previous - committed).abs() > f32::EPSILON {
                            memory.record(SliderCommit {
                                property: slider.target,
                                previous,
                                committed,
                            });
                        }
                    }
                }
            }
        }

        // Nob placement reflects the normalized value every frame, dragging
        // or not, so external changes (undo, presets) reposition it too.
        if let Some(children) = children {
            for child in children.iter() {
                if let Ok(mut nob_transform) = nob_query.get_mut(child) {
                    nob_transform.translation.x = (slider.value - 0.5) * slider.track_width;
                }
            }
        }
    }
}

/// The recompute-from-authority step. Runs every update tick: toggle state
/// and availability always reflect current truth, not cached truth, since
/// authorities change for reasons other than this control being pressed.
#[allow(clippy::too_many_arguments)]
pub fn mirror_authorities(
    tools: Res<ToolSelection>,
    environment: Res<Environment>,
    music: Res<MusicPlayback>,
    view_mode: Res<ViewMode>,
    colors: Res<ColorMode>,
    sync: Res<DriveSync>,
    panels: Res<PanelVisibility>,
    memory: Res<SketchMemory>,
    pressure: Res<MemoryPressure>,
    gate: Res<UndoRedoGate>,
    mut query: Query<(
        &mut Control,
        &mut Visibility,
        Option<&AuthorityFeed>,
        Option<&Children>,
    )>,
    mut caption_query: Query<&mut Text2d, With<ControlCaption>>,
) {
    for (control, mut visibility, feed, children) in query.iter_mut() {
        let control = control.into_inner();

        if control.availability != AvailabilityProbe::Manual {
            let available =
                probe_availability(control.availability, &sync, &memory, &pressure, &gate);
            if available != control.available {
                control.available = available;
                if !available && control.is_pressed() {
                    control.abort_press();
                }
            }
        }

        let mut caption: Option<String> = None;
        match &mut control.kind {
            ControlKind::Toggle(toggle) => {
                let was_active = control.toggle_active;
                let is_active = probe_state(
                    toggle.probe,
                    &tools,
                    &environment,
                    &music,
                    &colors,
                    &sync,
                    &panels,
                );
                if was_active != is_active {
                    caption = match (is_active, toggle.active_caption, toggle.base_caption) {
                        (true, Some(active), _) => Some(active.to_string()),
                        (false, _, Some(base)) => Some(base.to_string()),
                        _ => None,
                    };
                }
                control.toggle_active = is_active;
            }
            ControlKind::Multistate(multistate) => {
                // A single-option selector carries no information: hide it
                // outright rather than leaving it enabled.
                if multistate.options.len() < 2 {
                    *visibility = Visibility::Hidden;
                    control.available = false;
                    continue;
                }
                if *visibility == Visibility::Hidden {
                    *visibility = Visibility::Inherited;
                }

                if let Some(source) = multistate.mirror {
                    let refresh = multistate.last_shown.is_none()
                        || feed.is_none_or(|feed| feed.0.take_pending());
                    if refresh {
                        let index = match source {
                            MirrorSource::ViewMode => view_mode.index,
                            MirrorSource::ColorMode => colors.index,
                        };
                        multistate.selected = index.min(multistate.options.len() - 1);
                    }
                }
                if multistate.last_shown != Some(multistate.selected) {
                    multistate.last_shown = Some(multistate.selected);
                    caption = Some(multistate.options[multistate.selected].clone());
                }
            }
            ControlKind::Slider(slider) => {
                if !slider.dragging {
                    if let Some(domain) = read_property(slider.target, &environment, &music) {
                        let (lo, hi) = slider.range;
                        slider.value = domain_to_slider(domain, lo, hi, slider.power);
                    }
                }
            }
            ControlKind::Momentary | ControlKind::LongPress(_) => {}
        }

        if let (Some(text), Some(children)) = (caption, children) {
            for child in children.iter() {
                if let Ok(mut caption_text) = caption_query.get_mut(child) {
                    caption_text.0 = text.clone();
                }
            }
        }
    }
}

/// Presentation pass: color from the palette, hover/press nudges relative to
/// the captured base pose. Semantic state and its visual are written in the
/// same tick, so they can never skew across frames.
pub fn apply_control_visuals(
    mut query: Query<(
        &Control,
        &Hoverable,
        &mut ControlVisualState,
        &ControlPalette,
        &mut ControlBasePose,
        &mut Transform,
        Option<&mut Sprite>,
    )>,
) {
    for (control, hoverable, mut state, palette, mut base, mut transform, sprite) in
        query.iter_mut()
    {
        if !base.captured {
            base.captured = true;
            base.scale = transform.scale;
            base.z = transform.translation.z;
        }

        state.hovered = hoverable.hovered;
        state.pressed = control.is_pressed();
        state.activated = control.toggle_active;
        state.available = control.available;

        let color = if !state.available {
            dim_unavailable(palette.idle)
        } else if state.pressed {
            palette.pressed
        } else if state.activated {
            palette.activated
        } else if state.hovered {
            palette.hovered
        } else {
            palette.idle
        };
        if let Some(mut sprite) = sprite {
            sprite.color = color;
        }

        if !state.available {
            transform.scale = base.scale;
            transform.translation.z = base.z;
        } else if state.pressed {
            transform.translation.z = base.z + Z_ADJUST_CLICK;
            transform.scale = base.scale * HOVER_SCALE;
        } else if state.hovered {
            transform.translation.z = base.z + Z_ADJUST_HOVER;
            transform.scale = base.scale * HOVER_SCALE;
        } else {
            transform.translation.z = base.z;
            transform.scale = base.scale;
        }
    }
}

/// Audio feedback edges: hover gain, select, and the dulled thunk of a press
/// on an unavailable control.
pub fn control_feedback_audio(
    mut commands: Commands,
    controls: Query<(&Control, &Hoverable)>,
    pallet_query: Query<&TransientAudioPallet>,
    mut audio_query: Query<&mut TransientAudio>,
) {
    let Some(pallet) = pallet_query.iter().next() else {
        return;
    };
    for (control, hoverable) in controls.iter() {
        if hoverable.entered && control.available && !control.is_pressed() {
            TransientAudioPallet::play(&mut commands, pallet, UiSound::Hover, &mut audio_query);
        }
        if (control.fired.is_some() || control.popup_fired) && control.sound_on_press {
            TransientAudioPallet::play(&mut commands, pallet, UiSound::Select, &mut audio_query);
        }
        if control.denied {
            TransientAudioPallet::play(
                &mut commands,
                pallet,
                UiSound::DisabledSelect,
                &mut audio_query,
            );
        }
    }
}

/// Scoped change-notification subscription held by a control; dropping the
/// component (despawn included) releases it exactly once.
#[derive(Component)]
pub struct AuthorityFeed(pub crate::systems::authority::Subscription);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::authority::{Fog, SketchAction, Tool};

    fn momentary(action: SketchAction) -> Control {
        Control::new(
            ControlKind::Momentary,
            CommandBinding::new(action),
            Vec2::new(40.0, 40.0),
        )
    }

    #[test]
    fn press_fires_exactly_once_per_edge() {
        let mut control = momentary(SketchAction::ToggleMusic);
        assert_eq!(
            control.begin_press(),
            PressOutcome::Fire(SketchCommand::new(SketchAction::ToggleMusic))
        );
        assert_eq!(control.press_state, PressState::Pressed);
        assert_eq!(control.tick_held(0.2), PressOutcome::None);
        assert_eq!(control.tick_held(0.2), PressOutcome::None);
        assert_eq!(control.finish_press(true), PressOutcome::None);
        assert_eq!(control.press_state, PressState::Hovering);
    }

    #[test]
    fn unavailable_control_never_enters_pressed() {
        let mut control = momentary(SketchAction::ToggleMusic);
        control.available = false;
        assert_eq!(control.begin_press(), PressOutcome::None);
        assert_eq!(control.press_state, PressState::Idle);
    }

    fn long_press_control() -> Control {
        Control::new(
            ControlKind::LongPress(LongPressBehavior {
                threshold: 0.5,
                long: CommandBinding::new(SketchAction::DeleteSketch),
            }),
            CommandBinding::new(SketchAction::LoadSketch),
            Vec2::new(40.0, 40.0),
        )
    }

    #[test]
    fn short_release_fires_short_action_only() {
        let mut control = long_press_control();
        assert_eq!(control.begin_press(), PressOutcome::None);
        assert_eq!(control.tick_held(0.3), PressOutcome::None);
        assert_eq!(
            control.finish_press(true),
            PressOutcome::Fire(SketchCommand::new(SketchAction::LoadSketch))
        );
    }

    #[test]
    fn threshold_hold_fires_long_action_then_release_fires_nothing() {
        let mut control = long_press_control();
        assert_eq!(control.begin_press(), PressOutcome::None);
        assert_eq!(control.tick_held(0.3), PressOutcome::None);
        assert_eq!(
            control.tick_held(0.3),
            PressOutcome::Fire(SketchCommand::new(SketchAction::DeleteSketch))
        );
        assert_eq!(control.press_state, PressState::LongPressHeld);
        assert_eq!(control.tick_held(0.3), PressOutcome::None);
        assert_eq!(control.finish_press(true), PressOutcome::None);
    }

    #[test]
    fn aborted_cycle_fires_neither_action() {
        let mut control = long_press_control();
        control.begin_press();
        control.tick_held(0.2);
        control.abort_press();
        assert_eq!(control.press_state, PressState::Idle);
        assert_eq!(control.finish_press(false), PressOutcome::None);
    }

    #[test]
    fn slider_mapping_round_trips_through_power_curve() {
        let (lo, hi, power) = (0.2_f32, 5.0_f32, 2.0_f32);
        for value in [0.0_f32, 0.25, 0.5, 0.75, 1.0] {
            let domain = slider_to_domain(value, lo, hi, power);
            let expected = lo + (hi - lo) * value.powf(1.0 / power);
            assert!((domain - expected).abs() < 1e-6);
            let back = domain_to_slider(domain, lo, hi, power);
            assert!((back - value).abs() < 1e-5, "{back} vs {value}");
        }
    }

    #[test]
    fn multistate_local_advance_wraps_and_updates_param() {
        let mut control = Control::new(
            ControlKind::Multistate(MultistateBehavior::new(
                ["Wheel".to_string(), "Sliders".to_string(), "Palette".to_string()],
                None,
            )),
            CommandBinding::new(SketchAction::SelectColorMode),
            Vec2::new(40.0, 40.0),
        );

        for expected in [1, 2, 0] {
            let outcome = control.begin_press();
            assert_eq!(
                outcome,
                PressOutcome::Fire(SketchCommand::with_param(
                    SketchAction::SelectColorMode,
                    expected
                ))
            );
            control.finish_press(true);
        }
    }

    #[test]
    fn single_option_multistate_is_inert() {
        let mut control = Control::new(
            ControlKind::Multistate(MultistateBehavior::new(["Only".to_string()], None)),
            CommandBinding::new(SketchAction::SelectColorMode),
            Vec2::new(40.0, 40.0),
        );
        assert_eq!(control.begin_press(), PressOutcome::None);
    }

    /* ────────────────  system-level wiring  ──────────────── */

    fn harness() -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_plugins(InteractionPlugin);
        app
    }

    fn spawn_control(app: &mut App, control: Control, position: Vec3) -> Entity {
        app.world_mut()
            .spawn((
                control,
                Transform::from_translation(position),
                GlobalTransform::from_translation(position),
            ))
            .id()
    }

    fn point_at(app: &mut App, position: Vec2) {
        let mut pointer = app.world_mut().resource_mut::<GazePointer>();
        pointer.position = Some(position);
        pointer.press_edge = false;
        pointer.release_edge = false;
        pointer.held = false;
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
    fn toggle_mirrors_authority_not_local_parity() {
        let mut app = harness();
        let entity = spawn_control(
            &mut app,
            Control::new(
                ControlKind::Toggle(ToggleBehavior::new(StateProbe::ToolIs(Tool::Eraser))),
                CommandBinding::with_param(SketchAction::SelectTool, Tool::Eraser.to_param()),
                Vec2::new(40.0, 40.0),
            ),
            Vec3::ZERO,
        );

        app.update();
        assert!(!app.world().get::<Control>(entity).unwrap().toggle_active);

        // The authority changes for an unrelated reason: no press occurs,
        // yet the control reflects the new truth on the next refresh.
        app.world_mut().resource_mut::<ToolSelection>().active = Tool::Eraser;
        app.update();
        assert!(app.world().get::<Control>(entity).unwrap().toggle_active);

        // Pressing now acts on the authority's current value.
        click_at(&mut app, Vec2::ZERO);
        assert_eq!(app.world().resource::<ToolSelection>().active, Tool::Eraser);
        assert!(app.world().get::<Control>(entity).unwrap().toggle_active);
    }

    #[test]
    fn toggle_caption_swaps_exactly_once_per_activation() {
        let mut app = harness();
        let caption = app
            .world_mut()
            .spawn((Text2d::new("Play"), ControlCaption))
            .id();
        let entity = spawn_control(
            &mut app,
            Control::new(
                ControlKind::Toggle(
                    ToggleBehavior::new(StateProbe::MusicPlaying).with_captions("Play", "Pause"),
                ),
                CommandBinding::new(SketchAction::ToggleMusic),
                Vec2::new(40.0, 40.0),
            ),
            Vec3::ZERO,
        );
        app.world_mut().entity_mut(entity).add_child(caption);

        app.world_mut().resource_mut::<MusicPlayback>().playing = true;
        app.update();
        assert_eq!(app.world().get::<Text2d>(caption).unwrap().0, "Pause");

        // No further activation edge: a sentinel survives later refreshes,
        // proving the swap fired exactly once.
        app.world_mut().get_mut::<Text2d>(caption).unwrap().0 = "sentinel".to_string();
        app.update();
        assert_eq!(app.world().get::<Text2d>(caption).unwrap().0, "sentinel");
    }

    #[test]
    fn multistate_mirror_follows_authority_without_press() {
        let mut app = harness();
        let caption = app
            .world_mut()
            .spawn((Text2d::new(""), ControlCaption))
            .id();
        let feed = {
            let view_mode = app.world().resource::<ViewMode>();
            AuthorityFeed(view_mode.notifier.subscribe())
        };
        let entity = spawn_control(
            &mut app,
            Control::new(
                ControlKind::Multistate(MultistateBehavior::new(
                    ViewMode::LABELS.map(str::to_string),
                    Some(MirrorSource::ViewMode),
                )),
                CommandBinding::new(SketchAction::AdvanceViewMode),
                Vec2::new(40.0, 40.0),
            ),
            Vec3::ZERO,
        );
        app.world_mut().entity_mut(entity).insert(feed);
        app.world_mut().entity_mut(entity).add_child(caption);

        app.update();
        assert_eq!(app.world().get::<Text2d>(caption).unwrap().0, "Lit");

        app.world_mut().resource_mut::<ViewMode>().advance();
        app.update();
        let control = app.world().get::<Control>(entity).unwrap();
        let ControlKind::Multistate(multistate) = &control.kind else {
            panic!("expected multistate");
        };
        assert_eq!(multistate.selected, 1);
        assert_eq!(app.world().get::<Text2d>(caption).unwrap().0, "Wireframe");
    }

    #[test]
    fn color_mode_mirror_tracks_external_selection() {
        let mut app = harness();
        let entity = spawn_control(
            &mut app,
            Control::new(
                ControlKind::Multistate(MultistateBehavior::new(
                    ["Wheel", "Sliders", "Palette"].map(str::to_string),
                    Some(MirrorSource::ColorMode),
                )),
                CommandBinding::new(SketchAction::SelectColorMode),
                Vec2::new(40.0, 40.0),
            ),
            Vec3::ZERO,
        );

        app.update();
        app.world_mut().resource_mut::<ColorMode>().index = 2;
        app.update();

        let control = app.world().get::<Control>(entity).unwrap();
        let ControlKind::Multistate(multistate) = &control.kind else {
            panic!("expected multistate");
        };
        assert_eq!(multistate.selected, 2);
    }

    #[test]
    fn multistate_mirror_press_is_never_optimistic() {
        let mut app = harness();
        let entity = spawn_control(
            &mut app,
            Control::new(
                ControlKind::Multistate(MultistateBehavior::new(
                    ViewMode::LABELS.map(str::to_string),
                    Some(MirrorSource::ViewMode),
                )),
                CommandBinding::new(SketchAction::AdvanceViewMode),
                Vec2::new(40.0, 40.0),
            ),
            Vec3::ZERO,
        );

        app.update();
        click_at(&mut app, Vec2::ZERO);

        // The press routed through the authority: the displayed selection is
        // the authority's post-advance value, not a local increment applied
        // before the command landed.
        let control = app.world().get::<Control>(entity).unwrap();
        let ControlKind::Multistate(multistate) = &control.kind else {
            panic!("expected multistate");
        };
        assert_eq!(app.world().resource::<ViewMode>().index, 1);
        assert_eq!(multistate.selected, 1);
    }

    #[test]
    fn slider_drag_coalesces_one_commit_per_gesture() {
        let mut app = harness();
        let entity = spawn_control(
            &mut app,
            Control::new(
                ControlKind::Slider(
                    SliderBehavior::new(BoundProperty::LampIntensity, (0.0, 1.0), 1.0, 100.0)
                        .undoable(),
                ),
                CommandBinding::new(SketchAction::SelectEnvironment),
                Vec2::new(100.0, 20.0),
            ),
            Vec3::ZERO,
        );

        // Press on the track, drag across three frames, release.
        {
            let mut pointer = app.world_mut().resource_mut::<GazePointer>();
            pointer.position = Some(Vec2::new(-10.0, 0.0));
            pointer.press_edge = true;
            pointer.held = true;
        }
        app.update();
        for x in [0.0, 20.0, 30.0] {
            {
                let mut pointer = app.world_mut().resource_mut::<GazePointer>();
                pointer.press_edge = false;
                pointer.position = Some(Vec2::new(x, 0.0));
            }
            app.update();
        }
        {
            let mut pointer = app.world_mut().resource_mut::<GazePointer>();
            pointer.release_edge = true;
            pointer.held = false;
        }
        app.update();

        let memory = app.world().resource::<SketchMemory>();
        assert_eq!(memory.commits.len(), 1);
        let commit = memory.commits[0];
        assert_eq!(commit.property, BoundProperty::LampIntensity);
        assert!((commit.committed - 0.8).abs() < 1e-4);

        let control = app.world().get::<Control>(entity).unwrap();
        let ControlKind::Slider(slider) = &control.kind else {
            panic!("expected slider");
        };
        assert!(!slider.dragging);
        assert!((slider.value - 0.8).abs() < 1e-4);
        assert!((app.world().resource::<Environment>().lamp_intensity - 0.8).abs() < 1e-4);
    }

    #[test]
    fn slider_with_absent_property_skips_then_recovers() {
        let mut app = harness();
        app.world_mut().resource_mut::<Environment>().fog = None;
        let entity = spawn_control(
            &mut app,
            Control::new(
                ControlKind::Slider(SliderBehavior::new(
                    BoundProperty::FogDensity,
                    (0.0, 0.5),
                    1.0,
                    100.0,
                )),
                CommandBinding::new(SketchAction::SelectEnvironment),
                Vec2::new(100.0, 20.0),
            ),
            Vec3::ZERO,
        );

        {
            let mut pointer = app.world_mut().resource_mut::<GazePointer>();
            pointer.position = Some(Vec2::new(25.0, 0.0));
            pointer.press_edge = true;
            pointer.held = true;
        }
        app.update();
        // No fog layer: nothing was propagated, nothing was fatal.
        assert_eq!(app.world().resource::<Environment>().fog, None);

        {
            let mut pointer = app.world_mut().resource_mut::<GazePointer>();
            pointer.press_edge = false;
            pointer.release_edge = true;
            pointer.held = false;
        }
        app.update();

        // The property owner returns; visual polling resumes from its value.
        app.world_mut().resource_mut::<Environment>().fog = Some(Fog { density: 0.25 });
        {
            let mut pointer = app.world_mut().resource_mut::<GazePointer>();
            pointer.release_edge = false;
        }
        app.update();
        let control = app.world().get::<Control>(entity).unwrap();
        let ControlKind::Slider(slider) = &control.kind else {
            panic!("expected slider");
        };
        assert!((slider.value - 0.5).abs() < 1e-4);
    }

    #[test]
    fn availability_poll_flips_without_press() {
        let mut app = harness();
        let entity = spawn_control(
            &mut app,
            Control::new(
                ControlKind::Momentary,
                CommandBinding::new(SketchAction::Undo),
                Vec2::new(40.0, 40.0),
            )
            .with_availability(AvailabilityProbe::UndoAvailable),
            Vec3::ZERO,
        );

        app.update();
        assert!(!app.world().get::<Control>(entity).unwrap().available);

        app.world_mut()
            .resource_mut::<SketchMemory>()
            .record(SliderCommit {
                property: BoundProperty::LampIntensity,
                previous: 0.0,
                committed: 1.0,
            });
        app.update();
        assert!(app.world().get::<Control>(entity).unwrap().available);
    }

    #[test]
    fn memory_pressure_disables_downloads_only_when_critical() {
        use crate::systems::authority::{MemoryLevel, MemoryPressure};

        let mut app = harness();
        let entity = spawn_control(
            &mut app,
            Control::new(
                ControlKind::Momentary,
                CommandBinding::new(SketchAction::LoadSketch),
                Vec2::new(40.0, 40.0),
            )
            .with_availability(AvailabilityProbe::MemoryNotCritical),
            Vec3::ZERO,
        );

        app.world_mut().resource_mut::<MemoryPressure>().level = MemoryLevel::High;
        app.update();
        assert!(app.world().get::<Control>(entity).unwrap().available);

        app.world_mut().resource_mut::<MemoryPressure>().level = MemoryLevel::Critical;
        app.update();
        assert!(!app.world().get::<Control>(entity).unwrap().available);
    }

    #[test]
    fn topmost_control_wins_hover() {
        let mut app = harness();
        let low = spawn_control(
            &mut app,
            momentary(SketchAction::ToggleMusic),
            Vec3::new(0.0, 0.0, 1.0),
        );
        let high = spawn_control(
            &mut app,
            momentary(SketchAction::ToggleMusic),
            Vec3::new(0.0, 0.0, 5.0),
        );

        point_at(&mut app, Vec2::ZERO);
        app.update();
        assert!(!app.world().get::<Hoverable>(low).unwrap().hovered);
        assert!(app.world().get::<Hoverable>(high).unwrap().hovered);
    }
}
