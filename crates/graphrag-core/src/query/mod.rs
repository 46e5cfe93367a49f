pub mod guards;
pub mod overlay;
