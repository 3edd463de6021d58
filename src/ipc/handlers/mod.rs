pub mod core;
pub mod grades;
pub mod report_cards;
pub mod setup;
