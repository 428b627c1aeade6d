pub mod ask;
pub mod assistant;
pub mod pins;
pub mod restrict;
pub mod wordtracker;
