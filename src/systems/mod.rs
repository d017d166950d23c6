pub mod audio;
pub mod authority;
pub mod colors;
pub mod fetch;
pub mod interaction;
pub mod ui;
