pub mod progress;

pub use progress::ProgressRenderer;
