//! Transient popup lifecycle: `Opening -> Standard -> Closing -> Closed`.
//!
//! A popup is spawned by a control press, owns its child controls, and
//! reports its phase so the spawning panel can reclaim its active-popup slot
//! once closing finishes. Closing is reachable from Opening or Standard;
//! Closed only from Closing, and never leaves it.
use bevy::prelude::*;

use crate::{
    startup::pointer::GazePointer,
    systems::{
        audio::{TransientAudio, TransientAudioPallet, UiSound},
        authority::{AuthoritySystem, SketchCommand, UndoRedoGate},
        colors::POPUP_BACKGROUND,
        interaction::{Control, ControlCaption, InteractionPlugin, InteractionSystem},
    },
};

#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum PopupSystem {
    Init,
    Confirm,
    Lifecycle,
    Visuals,
}

pub struct PopupPlugin;

impl Plugin for PopupPlugin {
    fn build(&self, app: &mut App) {
        if !app.is_plugin_added::<InteractionPlugin>() {
            app.add_plugins(InteractionPlugin);
        }
        app.add_message::<PopupCloseRequest>()
            .add_message::<PopupClosed>()
            .configure_sets(
                Update,
                (
                    PopupSystem::Init.before(InteractionSystem::Hover),
                    PopupSystem::Confirm
                        .after(InteractionSystem::Triggers)
                        .before(PopupSystem::Lifecycle),
                    PopupSystem::Lifecycle.before(AuthoritySystem::ApplyCommands),
                    PopupSystem::Visuals.after(PopupSystem::Lifecycle),
                ),
            )
            .add_systems(
                Update,
                (
                    (apply_popup_params, popup_open_audio).in_set(PopupSystem::Init),
                    popup_confirm_buttons.in_set(PopupSystem::Confirm),
                    (popup_lifecycle, popup_paging, sync_undo_redo_gate)
                        .chain()
                        .in_set(PopupSystem::Lifecycle),
                    popup_visuals.in_set(PopupSystem::Visuals),
                ),
            );
    }
}

/* ─────────────────────────  DATA  ───────────────────────── */

/// What a press wants opened; the panel layer owns the actual layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PopupKind {
    UploadConfirm,
    SketchOptions,
    DownloadSketch,
    Sketchbook,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PopupPhase {
    Opening,
    Standard,
    Closing,
    Closed,
}

/// Outcome of one lifecycle step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PopupTick {
    None,
    BecameStandard,
    BecameClosed,
}

#[derive(Component)]
#[require(Transform, Visibility)]
pub struct Popup {
    pub kind: PopupKind,
    pub phase: PopupPhase,
    /// Counts up toward `transition_duration` while Opening and back down to
    /// zero while Closing. Starts at `-open_delay` so a delayed popup sits
    /// at ratio zero until the delay elapses.
    pub transition_value: f32,
    pub transition_duration: f32,
    pub open_delay: f32,
    /// Self-closes the frame the driving ray drops while Standard.
    pub long_press: bool,
    /// Refuses non-forced close requests.
    pub persistent: bool,
    pub audio_on_open: bool,
    /// While alive, undo/redo input is swallowed by the owning panel.
    pub block_undo_redo: bool,
    pub parent_panel: Entity,
    pub param: i32,
    pub param2: i32,
    /// Command held until the close animation resolves (long-press popups
    /// only; confirmation popups resolve immediately at confirm time).
    pub deferred: Option<SketchCommand>,
    pub region: Vec2,
    base_scale: Option<Vec3>,
}

impl Popup {
    pub fn new(kind: PopupKind, parent_panel: Entity) -> Self {
        Self {
            kind,
            phase: PopupPhase::Opening,
            transition_value: 0.0,
            transition_duration: 0.2,
            open_delay: 0.0,
            long_press: false,
            persistent: false,
            audio_on_open: true,
            block_undo_redo: false,
            parent_panel,
            param: -1,
            param2: -1,
            deferred: None,
            region: Vec2::new(220.0, 140.0),
            base_scale: None,
        }
    }

    pub fn with_duration(mut self, seconds: f32) -> Self {
        self.transition_duration = seconds;
        self
    }

    pub fn with_open_delay(mut self, seconds: f32) -> Self {
        self.open_delay = seconds;
        self.transition_value = -seconds;
        self
    }

    pub fn with_params(mut self, param: i32, param2: i32) -> Self {
        self.param = param;
        self.param2 = param2;
        self
    }

    pub fn long_press(mut self) -> Self {
        self.long_press = true;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn silent(mut self) -> Self {
        self.audio_on_open = false;
        self
    }

    pub fn blocking_undo_redo(mut self) -> Self {
        self.block_undo_redo = true;
        self
    }

    pub fn with_region(mut self, region: Vec2) -> Self {
        self.region = region;
        self
    }

    pub fn is_open(&self) -> bool {
        self.phase == PopupPhase::Standard
    }

    pub fn is_closing_or_closed(&self) -> bool {
        matches!(self.phase, PopupPhase::Closing | PopupPhase::Closed)
    }

    /// Visual interpolation fraction. Zero-duration popups are always at 1;
    /// there is no division in that case.
    pub fn transition_ratio(&self) -> f32 {
        if self.transition_duration == 0.0 {
            return 1.0;
        }
        (self.transition_value / self.transition_duration).clamp(0.0, 1.0)
    }

    /// Requests the Closing phase. Returns whether the request was accepted:
    /// persistent popups refuse non-forced requests, and a Closed popup is
    /// never reopened or re-closed. A request mid-Opening redirects into
    /// Closing from the current fractional transition value.
    pub fn request_close(&mut self, force: bool) -> bool {
        match self.phase {
            PopupPhase::Closed => false,
            PopupPhase::Closing => true,
            _ => {
                if force || !self.persistent {
                    self.phase = PopupPhase::Closing;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// One frame-step of the lifecycle machine.
    pub fn advance(&mut self, dt: f32) -> PopupTick {
        match self.phase {
            PopupPhase::Opening => {
                self.transition_value =
                    (self.transition_value + dt).min(self.transition_duration);
                if self.transition_ratio() >= 1.0 {
                    self.transition_value = self.transition_duration;
                    self.phase = PopupPhase::Standard;
                    PopupTick::BecameStandard
                } else {
                    PopupTick::None
                }
            }
            PopupPhase::Closing => {
                self.transition_value -= dt;
                if self.transition_value <= 0.0 || self.transition_duration == 0.0 {
                    self.transition_value = 0.0;
                    self.phase = PopupPhase::Closed;
                    PopupTick::BecameClosed
                } else {
                    PopupTick::None
                }
            }
            PopupPhase::Standard | PopupPhase::Closed => PopupTick::None,
        }
    }
}

/// Close request routed through the lifecycle system. `skip_transition`
/// collapses the closing animation to a single frame; panels use it when the
/// popup is being torn down with its owner so no timer outlives the panel.
#[derive(Message, Clone, Copy, Debug)]
pub struct PopupCloseRequest {
    pub popup: Entity,
    pub force: bool,
    pub skip_transition: bool,
}

impl PopupCloseRequest {
    pub fn new(popup: Entity) -> Self {
        Self {
            popup,
            force: false,
            skip_transition: false,
        }
    }

    pub fn force(popup: Entity) -> Self {
        Self {
            popup,
            force: true,
            skip_transition: false,
        }
    }

    pub fn teardown(popup: Entity) -> Self {
        Self {
            popup,
            force: true,
            skip_transition: true,
        }
    }
}

/// Delivered once, the frame a popup reaches Closed, so the spawning panel
/// can invalidate its active-popup slot.
#[derive(Message, Clone, Copy, Debug)]
pub struct PopupClosed {
    pub popup: Entity,
    pub panel: Entity,
}

/// Marks a child control whose press confirms the popup's command. The
/// command routes through the popup so deferral rules apply, instead of the
/// plain control trigger path.
#[derive(Component, Clone, Copy)]
pub struct PopupConfirmButton {
    pub popup: Entity,
}

/// Marks a child control that dismisses the popup without confirming.
#[derive(Component, Clone, Copy)]
pub struct PopupDismissButton {
    pub popup: Entity,
}

/* ─────────────────────────  PAGING  ───────────────────────── */

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageFlip {
    Standard,
    TransitionOut,
    TransitionIn,
}

/// Paged option grid inside a popup. Page flips shrink the grid, swap the
/// visible slots, then grow it back.
#[derive(Component)]
pub struct PopupPaging {
    pub page_index: usize,
    pub requested_page: usize,
    pub page_size: usize,
    pub entries: Vec<String>,
    pub flip: PageFlip,
    pub flip_amount: f32,
    pub flip_speed: f32,
    populated: bool,
}

impl PopupPaging {
    pub fn new(entries: Vec<String>, page_size: usize) -> Self {
        Self {
            page_index: 0,
            requested_page: 0,
            page_size: page_size.max(1),
            entries,
            flip: PageFlip::Standard,
            flip_amount: 0.0,
            flip_speed: 24.0,
            populated: false,
        }
    }

    pub fn page_count(&self) -> usize {
        self.entries.len().div_ceil(self.page_size).max(1)
    }

    pub fn goto_page(&mut self, index: isize) {
        let last = self.page_count() as isize - 1;
        self.requested_page = index.clamp(0, last) as usize;
    }

    pub fn advance_page(&mut self, amount: isize) {
        self.goto_page(self.page_index as isize + amount);
    }
}

/// Slot within a paged grid; `index` is the position on the current page.
#[derive(Component, Clone, Copy)]
pub struct PagingSlot {
    pub index: usize,
}

/// Page navigation arrow; `delta` is applied to the current page index.
#[derive(Component, Clone, Copy)]
pub struct PagingNavButton {
    pub popup: Entity,
    pub delta: isize,
}

/// Container entity scaled during page-flip transitions so slot controls
/// keep their own base poses.
#[derive(Component, Clone, Copy, Default)]
pub struct PagingGrid;

/* ─────────────────────────  SYSTEMS  ───────────────────────── */

/// Propagates the popup's two command parameters to every child control
/// before the popup's first interactive frame.
pub fn apply_popup_params(
    new_popups: Query<(Entity, &Popup), Added<Popup>>,
    children_query: Query<&Children>,
    mut controls: Query<&mut Control>,
) {
    for (entity, popup) in new_popups.iter() {
        let mut stack = vec![entity];
        while let Some(current) = stack.pop() {
            if let Ok(children) = children_query.get(current) {
                for child in children.iter() {
                    stack.push(child);
                }
            }
            if current == entity {
                continue;
            }
            if let Ok(mut control) = controls.get_mut(current) {
                control.binding.set_params(popup.param, popup.param2);
            }
        }
    }
}

pub fn popup_open_audio(
    mut commands: Commands,
    new_popups: Query<&Popup, Added<Popup>>,
    pallet_query: Query<&TransientAudioPallet>,
    mut audio_query: Query<&mut TransientAudio>,
) {
    let Some(pallet) = pallet_query.iter().next() else {
        return;
    };
    for popup in new_popups.iter() {
        if popup.audio_on_open {
            TransientAudioPallet::play(&mut commands, pallet, UiSound::PopupOpen, &mut audio_query);
        }
    }
}

/// Routes confirm/dismiss presses through the popup. For long-press popups
/// the confirmed command is held until Closed so the close animation runs
/// before any downstream effect; for ordinary confirmation popups the close
/// is itself the confirmation and the command resolves immediately.
pub fn popup_confirm_buttons(
    confirm_query: Query<(&Control, &PopupConfirmButton)>,
    dismiss_query: Query<(&Control, &PopupDismissButton)>,
    mut popups: Query<&mut Popup>,
    mut commands_out: MessageWriter<SketchCommand>,
    mut close_out: MessageWriter<PopupCloseRequest>,
) {
    for (control, confirm) in confirm_query.iter() {
        let Some(command) = control.fired else {
            continue;
        };
        let Ok(mut popup) = popups.get_mut(confirm.popup) else {
            continue;
        };
        if popup.is_closing_or_closed() {
            continue;
        }
        if popup.long_press {
            popup.deferred = Some(command);
        } else {
            commands_out.write(command);
        }
        close_out.write(PopupCloseRequest::force(confirm.popup));
    }

    for (control, dismiss) in dismiss_query.iter() {
        if control.fired.is_some() {
            close_out.write(PopupCloseRequest::new(dismiss.popup));
        }
    }
}

/// Ticks every popup, applies close requests, and finalizes Closed popups:
/// deferred command resolution, parent notification, despawn. A request
/// against an already-Closed popup is a no-op.
pub fn popup_lifecycle(
    mut commands: Commands,
    time: Res<Time>,
    pointer: Res<GazePointer>,
    mut close_requests: MessageReader<PopupCloseRequest>,
    mut popups: Query<(Entity, &mut Popup)>,
    mut closed_out: MessageWriter<PopupClosed>,
    mut commands_out: MessageWriter<SketchCommand>,
) {
    for (_, mut popup) in popups.iter_mut() {
        if popup.long_press && popup.is_open() && pointer.position.is_none() {
            popup.request_close(true);
        }
    }

    for request in close_requests.read() {
        let Ok((_, mut popup)) = popups.get_mut(request.popup) else {
            continue;
        };
        if popup.phase == PopupPhase::Closed {
            log::warn!("close requested on a closed popup; ignoring");
            continue;
        }
        if popup.request_close(request.force) && request.skip_transition {
            popup.transition_value = 0.0;
        }
    }

    let dt = time.delta_secs();
    for (entity, mut popup) in popups.iter_mut() {
        if popup.phase == PopupPhase::Closed {
            continue;
        }
        if popup.advance(dt) == PopupTick::BecameClosed {
            log::debug!("{:?} popup closed", popup.kind);
            if let Some(command) = popup.deferred.take() {
                commands_out.write(command);
            }
            closed_out.write(PopupClosed {
                popup: entity,
                panel: popup.parent_panel,
            });
            commands.entity(entity).despawn();
        }
    }
}

/// Scale/tint interpolation driven by the transition ratio. A popup with an
/// open delay stays hidden until its transition value crosses zero.
pub fn popup_visuals(
    mut query: Query<(&mut Popup, &mut Transform, &mut Visibility, Option<&mut Sprite>)>,
) {
    for (popup, mut transform, mut visibility, sprite) in query.iter_mut() {
        let popup = popup.into_inner();
        let base = *popup.base_scale.get_or_insert(transform.scale);
        let ratio = popup.transition_ratio();
        transform.scale = Vec3::new(base.x * ratio, base.y * ratio, base.z);
        if popup.open_delay > 0.0 {
            *visibility = if popup.phase == PopupPhase::Opening && popup.transition_value < 0.0 {
                Visibility::Hidden
            } else {
                Visibility::Inherited
            };
        }
        if let Some(mut sprite) = sprite {
            let target = POPUP_BACKGROUND.to_srgba();
            sprite.color = Color::Srgba(target.with_alpha(target.alpha * ratio));
        }
    }
}

/// Page-flip machine and slot population for paged popups.
#[allow(clippy::too_many_arguments)]
pub fn popup_paging(
    time: Res<Time>,
    mut popups: Query<(Entity, &Popup, &mut PopupPaging)>,
    nav_query: Query<(&Control, &PagingNavButton)>,
    mut nav_visibility: Query<(&PagingNavButton, &mut Visibility)>,
    children_query: Query<&Children>,
    mut grid_query: Query<&mut Transform, With<PagingGrid>>,
    mut slot_query: Query<
        (&mut Control, &PagingSlot, &mut Visibility, Option<&Children>),
        (Without<PagingNavButton>, Without<PagingGrid>),
    >,
    mut caption_query: Query<&mut Text2d, With<ControlCaption>>,
) {
    for (control, nav) in nav_query.iter() {
        if control.fired.is_some() {
            if let Ok((_, _, mut paging)) = popups.get_mut(nav.popup) {
                paging.advance_page(nav.delta);
            }
        }
    }

    let dt = time.delta_secs();
    for (entity, popup, mut paging) in popups.iter_mut() {
        let paging = paging.into_inner();

        match paging.flip {
            PageFlip::Standard => {
                if !paging.populated {
                    paging.populated = true;
                    populate_page(
                        entity,
                        popup,
                        paging,
                        &children_query,
                        &mut slot_query,
                        &mut caption_query,
                        &mut nav_visibility,
                    );
                }
                if paging.requested_page != paging.page_index {
                    paging.flip_amount = 0.0;
                    paging.flip = PageFlip::TransitionOut;
                }
            }
            PageFlip::TransitionOut => {
                paging.flip_amount = (paging.flip_amount + dt * paging.flip_speed).min(1.0);
                if paging.flip_amount >= 1.0 {
                    paging.page_index = paging.requested_page;
                    populate_page(
                        entity,
                        popup,
                        paging,
                        &children_query,
                        &mut slot_query,
                        &mut caption_query,
                        &mut nav_visibility,
                    );
                    paging.flip = PageFlip::TransitionIn;
                }
            }
            PageFlip::TransitionIn => {
                paging.flip_amount = (paging.flip_amount - dt * paging.flip_speed).max(0.0);
                if paging.flip_amount <= 0.0 {
                    paging.flip = PageFlip::Standard;
                }
            }
        }

        let grid_scale = 1.0 - paging.flip_amount;
        for child in descendants(entity, &children_query) {
            if let Ok(mut grid_transform) = grid_query.get_mut(child) {
                grid_transform.scale = Vec3::new(grid_scale.max(0.01), grid_scale.max(0.01), 1.0);
            }
        }
    }
}

fn descendants(root: Entity, children_query: &Query<&Children>) -> Vec<Entity> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(current) = stack.pop() {
        if let Ok(children) = children_query.get(current) {
            for child in children.iter() {
                out.push(child);
                stack.push(child);
            }
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn populate_page(
    popup_entity: Entity,
    popup: &Popup,
    paging: &PopupPaging,
    children_query: &Query<&Children>,
    slot_query: &mut Query<
        (&mut Control, &PagingSlot, &mut Visibility, Option<&Children>),
        (Without<PagingNavButton>, Without<PagingGrid>),
    >,
    caption_query: &mut Query<&mut Text2d, With<ControlCaption>>,
    nav_visibility: &mut Query<(&PagingNavButton, &mut Visibility)>,
) {
    for child in descendants(popup_entity, children_query) {
        if let Ok((control, slot, visibility, slot_children)) = slot_query.get_mut(child) {
            let control = control.into_inner();
            let global_index = paging.page_index * paging.page_size + slot.index;
            if global_index < paging.entries.len() {
                *visibility.into_inner() = Visibility::Inherited;
                control.binding.set_params(popup.param, global_index as i32);
                if let Some(slot_children) = slot_children {
                    for slot_child in slot_children.iter() {
                        if let Ok(mut caption) = caption_query.get_mut(slot_child) {
                            caption.0 = paging.entries[global_index].clone();
                        }
                    }
                }
            } else {
                *visibility.into_inner() = Visibility::Hidden;
            }
        }
    }

    // Arrows hide at the ends of the range.
    for child in descendants(popup_entity, children_query) {
        if let Ok((nav, mut visibility)) = nav_visibility.get_mut(child) {
            let in_range = if nav.delta < 0 {
                paging.page_index > 0
            } else {
                paging.page_index + 1 < paging.page_count()
            };
            *visibility = if in_range {
                Visibility::Inherited
            } else {
                Visibility::Hidden
            };
        }
    }
}

/// Undo/redo input is swallowed while any live popup asks for it.
pub fn sync_undo_redo_gate(popups: Query<&Popup>, mut gate: ResMut<UndoRedoGate>) {
    gate.blocked = popups
        .iter()
        .any(|popup| popup.block_undo_redo && popup.phase != PopupPhase::Closed);
}
