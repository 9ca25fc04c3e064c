pub mod labels;
pub mod ownership;
pub mod protection;
pub mod status;
