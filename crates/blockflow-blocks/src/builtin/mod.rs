pub mod action;
pub mod display;
pub mod filter;
pub mod trigger;

pub use action::{JoinText, WalletInfo};
pub use display::LogDisplay;
pub use filter::CompareFilter;
pub use trigger::{IntervalTrigger, ManualTrigger};
