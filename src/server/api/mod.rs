pub mod channels_controller;
pub mod health_controller;
pub mod playback_controller;
pub mod render_controller;
