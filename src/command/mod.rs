pub mod recording_status;
pub mod save_recording;
pub mod start_recording;
pub mod stop_recording;

pub use recording_status::recording_status;
pub use save_recording::save_recording;
pub use start_recording::start_recording;
pub use stop_recording::stop_recording;
