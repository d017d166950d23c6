use bevy::prelude::*;

pub const PRIMARY_COLOR: Color = Color::Srgba(Srgba::new(0.92, 0.92, 0.92, 1.0));
pub const HOVERED_CONTROL: Color = Color::srgb(0.35, 0.85, 0.95);
pub const PRESSED_CONTROL: Color = Color::srgb(0.95, 0.85, 0.2);
pub const ACTIVATED_CONTROL: Color = Color::srgb(0.3, 0.95, 0.55);
pub const DANGER_COLOR: Color = Color::srgb(0.9, 0.2, 0.2);

pub const POPUP_BACKGROUND: Color = Color::Srgba(Srgba::new(0.08, 0.09, 0.12, 0.92));
pub const PANEL_BACKGROUND: Color = Color::Srgba(Srgba::new(0.13, 0.14, 0.18, 0.85));

const UNAVAILABLE_TINT: f32 = 0.35;

/// Color set a control renders with in each interaction state.
#[derive(Component, Clone, Copy, Debug)]
pub struct ControlPalette {
    pub idle: Color,
    pub hovered: Color,
    pub pressed: Color,
    pub activated: Color,
}

impl Default for ControlPalette {
    fn default() -> Self {
        Self {
            idle: PRIMARY_COLOR,
            hovered: HOVERED_CONTROL,
            pressed: PRESSED_CONTROL,
            activated: ACTIVATED_CONTROL,
        }
    }
}

impl ControlPalette {
    pub fn with_idle(mut self, idle: Color) -> Self {
        self.idle = idle;
        self
    }
}

/// Disabled rendering keeps alpha and darkens the channels, so an
/// unavailable control stays legible but visibly inert.
pub fn dim_unavailable(color: Color) -> Color {
    let srgba = color.to_srgba();
    Color::Srgba(Srgba::new(
        srgba.red * UNAVAILABLE_TINT,
        srgba.green * UNAVAILABLE_TINT,
        srgba.blue * UNAVAILABLE_TINT,
        srgba.alpha,
    ))
}
