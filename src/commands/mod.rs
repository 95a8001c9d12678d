pub mod app_info;
pub mod chart;
pub mod countdown;
pub mod health;
pub mod navigation;
