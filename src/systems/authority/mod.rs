//! Application-state authorities and the command vocabulary controls speak.
//!
//! Behavioral truth for everything a widget mirrors lives here: the active
//! tool, the environment preset, music playback, drive sync, sketch memory.
//! Controls never cache this state authoritatively; they re-poll it every
//! frame and treat change notifications as "something changed, re-poll me"
//! signals rather than payload pushes.
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use bevy::prelude::*;
use once_cell::sync::Lazy;
use serde::Deserialize;

#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum AuthoritySystem {
    ApplyCommands,
}

pub struct AuthorityPlugin;

impl Plugin for AuthorityPlugin {
    fn build(&self, app: &mut App) {
        app.add_message::<SketchCommand>()
            .init_resource::<ToolSelection>()
            .init_resource::<Environment>()
            .init_resource::<MusicPlayback>()
            .init_resource::<ViewMode>()
            .init_resource::<ColorMode>()
            .init_resource::<DriveSync>()
            .init_resource::<SketchMemory>()
            .init_resource::<MemoryPressure>()
            .init_resource::<PanelVisibility>()
            .init_resource::<UndoRedoGate>()
            .add_systems(
                Update,
                apply_commands.in_set(AuthoritySystem::ApplyCommands),
            );
    }
}

/* ─────────────────────  CHANGE NOTIFICATION  ───────────────────── */

#[derive(Default)]
struct NotifierInner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, bool>>,
}

/// Observer registry owned by one authority. Subscribers receive a scoped
/// [`Subscription`] handle; releasing (or dropping) the handle unregisters
/// exactly once, so subscribe/unsubscribe pairing is structural.
#[derive(Default, Clone)]
pub struct ChangeNotifier {
    inner: Arc<NotifierInner>,
}

impl ChangeNotifier {
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .pending
            .lock()
            .expect("notifier lock poisoned")
            .insert(id, false);
        Subscription {
            inner: Arc::clone(&self.inner),
            id,
            released: false,
        }
    }

    /// Flag every live subscriber. Zero-argument on purpose: subscribers
    /// re-poll the authority rather than receiving a payload.
    pub fn notify(&self) {
        for flag in self
            .inner
            .pending
            .lock()
            .expect("notifier lock poisoned")
            .values_mut()
        {
            *flag = true;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .expect("notifier lock poisoned")
            .len()
    }
}

/// Scoped subscription handle. `take_pending` consumes the "re-poll me" flag;
/// dropping the handle unregisters it from the owning notifier.
pub struct Subscription {
    inner: Arc<NotifierInner>,
    id: u64,
    released: bool,
}

impl Subscription {
    pub fn take_pending(&self) -> bool {
        let mut pending = self.inner.pending.lock().expect("notifier lock poisoned");
        match pending.get_mut(&self.id) {
            Some(flag) => std::mem::take(flag),
            None => false,
        }
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.inner
            .pending
            .lock()
            .expect("notifier lock poisoned")
            .remove(&self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/* ─────────────────────  COMMAND VOCABULARY  ───────────────────── */

/// One emitted widget command: an action plus up to two integer parameters,
/// used polymorphically as indices (sketch index, sketch-set kind, mode
/// index, panel id).
#[derive(Message, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SketchCommand {
    pub action: SketchAction,
    pub param: i32,
    pub param2: i32,
}

impl SketchCommand {
    pub const fn new(action: SketchAction) -> Self {
        Self {
            action,
            param: -1,
            param2: -1,
        }
    }

    pub const fn with_param(action: SketchAction, param: i32) -> Self {
        Self {
            action,
            param,
            param2: -1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SketchAction {
    SelectTool,
    SelectEnvironment,
    ToggleMusic,
    AdvanceViewMode,
    SelectColorMode,
    ToggleDriveSync,
    TogglePanel,
    LoadSketch,
    UploadSketch,
    DeleteSketch,
    Undo,
}

/// Command binding carried by a control: the command it emits when pressed,
/// with parameters assigned either at construction or by the popup that owns
/// the control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandBinding {
    pub action: SketchAction,
    pub param: i32,
    pub param2: i32,
}

impl CommandBinding {
    pub const fn new(action: SketchAction) -> Self {
        Self {
            action,
            param: -1,
            param2: -1,
        }
    }

    pub const fn with_param(action: SketchAction, param: i32) -> Self {
        Self {
            action,
            param,
            param2: -1,
        }
    }

    pub fn set_params(&mut self, param: i32, param2: i32) {
        self.param = param;
        self.param2 = param2;
    }

    pub fn command(&self) -> SketchCommand {
        SketchCommand {
            action: self.action,
            param: self.param,
            param2: self.param2,
        }
    }
}

/* ─────────────────────  AUTHORITIES  ───────────────────── */

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tool {
    Brush,
    Eraser,
    Fill,
    Grab,
}

impl Tool {
    pub fn from_param(param: i32) -> Option<Tool> {
        match param {
            0 => Some(Tool::Brush),
            1 => Some(Tool::Eraser),
            2 => Some(Tool::Fill),
            3 => Some(Tool::Grab),
            _ => None,
        }
    }

    pub fn to_param(self) -> i32 {
        match self {
            Tool::Brush => 0,
            Tool::Eraser => 1,
            Tool::Fill => 2,
            Tool::Grab => 3,
        }
    }
}

#[derive(Resource)]
pub struct ToolSelection {
    pub active: Tool,
    pub notifier: ChangeNotifier,
}

impl Default for ToolSelection {
    fn default() -> Self {
        Self {
            active: Tool::Brush,
            notifier: ChangeNotifier::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fog {
    pub density: f32,
}

/// Scene environment store. Fog is optional: presets without a fog layer
/// leave it `None`, and sliders bound to fog density skip propagation until
/// a fog-bearing preset is selected again.
#[derive(Resource)]
pub struct Environment {
    pub preset: usize,
    pub fog: Option<Fog>,
    pub lamp_intensity: f32,
    pub notifier: ChangeNotifier,
}

impl Default for Environment {
    fn default() -> Self {
        let preset = &environment_presets()[0];
        Self {
            preset: 0,
            fog: preset.fog_density.map(|density| Fog { density }),
            lamp_intensity: preset.lamp_intensity,
            notifier: ChangeNotifier::default(),
        }
    }
}

impl Environment {
    pub fn apply_preset(&mut self, index: usize) {
        let presets = environment_presets();
        let Some(preset) = presets.get(index) else {
            log::warn!("environment preset {index} out of range");
            return;
        };
        self.preset = index;
        self.fog = preset.fog_density.map(|density| Fog { density });
        self.lamp_intensity = preset.lamp_intensity;
        self.notifier.notify();
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct EnvironmentPreset {
    pub name: String,
    pub fog_density: Option<f32>,
    pub lamp_intensity: f32,
}

static ENVIRONMENT_PRESETS: Lazy<Vec<EnvironmentPreset>> = Lazy::new(|| {
    serde_json::from_str(include_str!("environment_presets.json"))
        .expect("environment preset table is malformed")
});

pub fn environment_presets() -> &'static [EnvironmentPreset] {
    &ENVIRONMENT_PRESETS
}

#[derive(Resource)]
pub struct MusicPlayback {
    pub playing: bool,
    pub volume: f32,
    pub notifier: ChangeNotifier,
}

impl Default for MusicPlayback {
    fn default() -> Self {
        Self {
            playing: false,
            volume: 0.8,
            notifier: ChangeNotifier::default(),
        }
    }
}

/// Sketch display mode: the shared "current mode" value mirrored by the
/// view-mode multistate button. Pressing that button never advances this
/// directly; it emits `AdvanceViewMode` and waits for the change
/// notification.
#[derive(Resource)]
pub struct ViewMode {
    pub index: usize,
    pub notifier: ChangeNotifier,
}

impl Default for ViewMode {
    fn default() -> Self {
        Self {
            index: 0,
            notifier: ChangeNotifier::default(),
        }
    }
}

impl ViewMode {
    pub const LABELS: [&'static str; 3] = ["Lit", "Wireframe", "Ghost"];

    pub fn advance(&mut self) {
        self.index = (self.index + 1) % Self::LABELS.len();
        self.notifier.notify();
    }
}

#[derive(Resource)]
pub struct ColorMode {
    pub index: usize,
    pub notifier: ChangeNotifier,
}

impl Default for ColorMode {
    fn default() -> Self {
        Self {
            index: 0,
            notifier: ChangeNotifier::default(),
        }
    }
}

#[derive(Resource)]
pub struct DriveSync {
    pub signed_in: bool,
    pub sync_enabled: bool,
    /// Set when an upload is confirmed; cleared by the (excluded) transport.
    pub pending_upload: Option<(i32, i32)>,
    pub notifier: ChangeNotifier,
}

impl Default for DriveSync {
    fn default() -> Self {
        Self {
            signed_in: true,
            sync_enabled: false,
            pending_upload: None,
            notifier: ChangeNotifier::default(),
        }
    }
}

/// Undo record for one coalesced slider gesture: the bound property, the
/// value before the drag began, and the value committed at release.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SliderCommit {
    pub property: BoundProperty,
    pub previous: f32,
    pub committed: f32,
}

#[derive(Resource, Default)]
pub struct SketchMemory {
    pub commits: Vec<SliderCommit>,
    pub notifier: ChangeNotifier,
}

impl SketchMemory {
    pub fn record(&mut self, commit: SliderCommit) {
        self.commits.push(commit);
        self.notifier.notify();
    }

    pub fn can_undo(&self) -> bool {
        !self.commits.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MemoryLevel {
    #[default]
    Nominal,
    High,
    Critical,
}

#[derive(Resource, Default)]
pub struct MemoryPressure {
    pub level: MemoryLevel,
    pub notifier: ChangeNotifier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PanelKind {
    Tools,
    Lights,
    Sketchbook,
}

impl PanelKind {
    pub fn from_param(param: i32) -> Option<PanelKind> {
        match param {
            0 => Some(PanelKind::Tools),
            1 => Some(PanelKind::Lights),
            2 => Some(PanelKind::Sketchbook),
            _ => None,
        }
    }

    pub fn to_param(self) -> i32 {
        match self {
            PanelKind::Tools => 0,
            PanelKind::Lights => 1,
            PanelKind::Sketchbook => 2,
        }
    }
}

#[derive(Resource)]
pub struct PanelVisibility {
    pub open: HashSet<PanelKind>,
    pub notifier: ChangeNotifier,
}

impl Default for PanelVisibility {
    fn default() -> Self {
        Self {
            open: HashSet::from([PanelKind::Tools, PanelKind::Lights, PanelKind::Sketchbook]),
            notifier: ChangeNotifier::default(),
        }
    }
}

/// Raised while a popup that swallows undo/redo input is alive.
#[derive(Resource, Default)]
pub struct UndoRedoGate {
    pub blocked: bool,
}

/* ─────────────────────  PROPERTY BINDING  ───────────────────── */

/// A domain property a slider can be bound to. The property owner may be
/// absent (fog without a fog layer); reads return `None` and writes are
/// skipped softly in that case.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundProperty {
    LampIntensity,
    FogDensity,
    MusicVolume,
}

pub fn read_property(
    property: BoundProperty,
    environment: &Environment,
    music: &MusicPlayback,
) -> Option<f32> {
    match property {
        BoundProperty::LampIntensity => Some(environment.lamp_intensity),
        BoundProperty::FogDensity => environment.fog.as_ref().map(|fog| fog.density),
        BoundProperty::MusicVolume => Some(music.volume),
    }
}

/// Returns false when the property owner is absent; the caller treats that
/// as a soft skip, not an error.
pub fn write_property(
    property: BoundProperty,
    value: f32,
    environment: &mut Environment,
    music: &mut MusicPlayback,
) -> bool {
    match property {
        BoundProperty::LampIntensity => {
            environment.lamp_intensity = value;
            environment.notifier.notify();
            true
        }
        BoundProperty::FogDensity => match environment.fog.as_mut() {
            Some(fog) => {
                fog.density = value;
                environment.notifier.notify();
                true
            }
            None => false,
        },
        BoundProperty::MusicVolume => {
            music.volume = value;
            music.notifier.notify();
            true
        }
    }
}

/* ─────────────────────  PROBES  ───────────────────── */

/// Pull-style predicate a toggle control recomputes every frame. The probe
/// is the only coupling between a control and the authority it mirrors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateProbe {
    ToolIs(Tool),
    EnvironmentPresetIs(usize),
    MusicPlaying,
    PanelOpen(PanelKind),
    SyncEnabled,
    ColorModeIs(usize),
}

pub fn probe_state(
    probe: StateProbe,
    tools: &ToolSelection,
    environment: &Environment,
    music: &MusicPlayback,
    colors: &ColorMode,
    sync: &DriveSync,
    panels: &PanelVisibility,
) -> bool {
    match probe {
        StateProbe::ToolIs(tool) => tools.active == tool,
        StateProbe::EnvironmentPresetIs(index) => environment.preset == index,
        StateProbe::MusicPlaying => music.playing,
        StateProbe::PanelOpen(kind) => panels.open.contains(&kind),
        StateProbe::SyncEnabled => sync.sync_enabled,
        StateProbe::ColorModeIs(index) => colors.index == index,
    }
}

/// Availability predicate for controls that poll it (upload needs a signed-in
/// sync service, undo needs history and an open gate, downloads back off
/// under memory pressure).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AvailabilityProbe {
    #[default]
    Always,
    SyncSignedIn,
    UndoAvailable,
    MemoryNotCritical,
    /// Availability is owned by whichever system drives the control (e.g. a
    /// fetch poller); the per-frame poll leaves it alone.
    Manual,
}

pub fn probe_availability(
    probe: AvailabilityProbe,
    sync: &DriveSync,
    memory: &SketchMemory,
    pressure: &MemoryPressure,
    gate: &UndoRedoGate,
) -> bool {
    match probe {
        AvailabilityProbe::Always | AvailabilityProbe::Manual => true,
        AvailabilityProbe::SyncSignedIn => sync.signed_in,
        AvailabilityProbe::UndoAvailable => memory.can_undo() && !gate.blocked,
        AvailabilityProbe::MemoryNotCritical => pressure.level != MemoryLevel::Critical,
    }
}

/* ─────────────────────  COMMAND APPLICATION  ───────────────────── */

#[allow(clippy::too_many_arguments)]
pub fn apply_commands(
    mut commands_in: MessageReader<SketchCommand>,
    mut tools: ResMut<ToolSelection>,
    mut environment: ResMut<Environment>,
    mut music: ResMut<MusicPlayback>,
    mut view_mode: ResMut<ViewMode>,
    mut colors: ResMut<ColorMode>,
    mut sync: ResMut<DriveSync>,
    mut memory: ResMut<SketchMemory>,
    mut panels: ResMut<PanelVisibility>,
) {
    for command in commands_in.read() {
        match command.action {
            SketchAction::SelectTool => match Tool::from_param(command.param) {
                Some(tool) => {
                    if tools.active != tool {
                        tools.active = tool;
                        tools.notifier.notify();
                    }
                }
                None => log::warn!("select-tool command with bad param {}", command.param),
            },
            SketchAction::SelectEnvironment => {
                if command.param >= 0 {
                    environment.apply_preset(command.param as usize);
                }
            }
            SketchAction::ToggleMusic => {
                music.playing = !music.playing;
                music.notifier.notify();
            }
            SketchAction::AdvanceViewMode => view_mode.advance(),
            SketchAction::SelectColorMode => {
                if command.param >= 0 {
                    colors.index = command.param as usize;
                    colors.notifier.notify();
                }
            }
            SketchAction::ToggleDriveSync => {
                if sync.signed_in {
                    sync.sync_enabled = !sync.sync_enabled;
                    sync.notifier.notify();
                } else {
                    log::debug!("drive sync toggle ignored: not signed in");
                }
            }
            SketchAction::TogglePanel => {
                if let Some(kind) = PanelKind::from_param(command.param) {
                    if !panels.open.remove(&kind) {
                        panels.open.insert(kind);
                    }
                    panels.notifier.notify();
                }
            }
            SketchAction::LoadSketch => {
                log::info!(
                    "load sketch {} from set {}",
                    command.param2,
                    command.param
                );
            }
            SketchAction::UploadSketch => {
                sync.pending_upload = Some((command.param, command.param2));
                sync.notifier.notify();
            }
            SketchAction::DeleteSketch => {
                log::info!(
                    "delete sketch {} from set {}",
                    command.param2,
                    command.param
                );
            }
            SketchAction::Undo => {
                if let Some(commit) = memory.commits.pop() {
                    write_property(commit.property, commit.previous, &mut environment, &mut music);
                    memory.notifier.notify();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_sees_notifications_once() {
        let notifier = ChangeNotifier::default();
        let subscription = notifier.subscribe();

        assert!(!subscription.take_pending());
        notifier.notify();
        assert!(subscription.take_pending());
        assert!(!subscription.take_pending());
    }

    #[test]
    fn subscription_release_unregisters_exactly_once() {
        let notifier = ChangeNotifier::default();
        let mut first = notifier.subscribe();
        let second = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 2);

        first.release();
        assert_eq!(notifier.subscriber_count(), 1);
        first.release();
        assert_eq!(notifier.subscriber_count(), 1);

        drop(first);
        assert_eq!(notifier.subscriber_count(), 1);
        drop(second);
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn dropped_subscription_stops_receiving() {
        let notifier = ChangeNotifier::default();
        let subscription = notifier.subscribe();
        drop(subscription);
        notifier.notify();
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn view_mode_advance_wraps() {
        let mut mode = ViewMode::default();
        for expected in [1, 2, 0, 1] {
            mode.advance();
            assert_eq!(mode.index, expected);
        }
    }

    #[test]
    fn fog_property_is_soft_when_absent() {
        let mut environment = Environment::default();
        let mut music = MusicPlayback::default();
        environment.fog = None;

        assert_eq!(read_property(BoundProperty::FogDensity, &environment, &music), None);
        assert!(!write_property(
            BoundProperty::FogDensity,
            0.5,
            &mut environment,
            &mut music
        ));

        environment.fog = Some(Fog { density: 0.1 });
        assert!(write_property(
            BoundProperty::FogDensity,
            0.5,
            &mut environment,
            &mut music
        ));
        assert_eq!(
            read_property(BoundProperty::FogDensity, &environment, &music),
            Some(0.5)
        );
    }

    #[test]
    fn probes_reflect_current_authority_state() {
        let tools = ToolSelection::default();
        let environment = Environment::default();
        let music = MusicPlayback::default();
        let mut colors = ColorMode::default();
        let sync = DriveSync::default();
        let panels = PanelVisibility::default();

        colors.index = 2;
        assert!(probe_state(
            StateProbe::ColorModeIs(2),
            &tools,
            &environment,
            &music,
            &colors,
            &sync,
            &panels
        ));
        assert!(!probe_state(
            StateProbe::ColorModeIs(0),
            &tools,
            &environment,
            &music,
            &colors,
            &sync,
            &panels
        ));
        assert!(probe_state(
            StateProbe::PanelOpen(PanelKind::Lights),
            &tools,
            &environment,
            &music,
            &colors,
            &sync,
            &panels
        ));
    }

    #[test]
    fn apply_commands_selects_tool_and_notifies() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_plugins(AuthorityPlugin);

        let subscription = app
            .world()
            .resource::<ToolSelection>()
            .notifier
            .subscribe();

        app.world_mut()
            .resource_mut::<Messages<SketchCommand>>()
            .write(SketchCommand::with_param(SketchAction::SelectTool, 2));
        app.update();

        assert_eq!(app.world().resource::<ToolSelection>().active, Tool::Fill);
        assert!(subscription.take_pending());

        // Re-selecting the current tool is not a change and must not notify.
        app.world_mut()
            .resource_mut::<Messages<SketchCommand>>()
            .write(SketchCommand::with_param(SketchAction::SelectTool, 2));
        app.update();
        assert!(!subscription.take_pending());
    }

    #[test]
    fn undo_restores_previous_slider_value() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_plugins(AuthorityPlugin);

        app.world_mut()
            .resource_mut::<Environment>()
            .lamp_intensity = 0.9;
        app.world_mut()
            .resource_mut::<SketchMemory>()
            .record(SliderCommit {
                property: BoundProperty::LampIntensity,
                previous: 0.4,
                committed: 0.9,
            });

        app.world_mut()
            .resource_mut::<Messages<SketchCommand>>()
            .write(SketchCommand::new(SketchAction::Undo));
        app.update();

        assert_eq!(app.world().resource::<Environment>().lamp_intensity, 0.4);
        assert!(!app.world().resource::<SketchMemory>().can_undo());
    }
}
