pub mod set_reminder;
pub mod video_summary;
pub mod web_search;

pub use set_reminder::ReminderTool;
pub use video_summary::{extract_video_id, VideoSummaryTool};
pub use web_search::WebSearchTool;
