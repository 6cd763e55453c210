pub mod error;
pub mod fixture;
pub mod manager;
pub mod message;
pub mod template;

mod funcs;
mod latch;
mod links;
mod pipe;
mod rate;
mod worker;


pub use error::{Error, Result};
pub use manager::{CampaignStats, Manager};
pub use message::{CampaignMessage, CompiledCampaign};
pub use template::{CompiledTemplate, Template};
