pub mod configuration;
pub mod controller;
pub mod logger;
pub mod runahead;
pub mod work;
pub mod worker;
