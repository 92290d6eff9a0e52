mod cache;
pub mod client;
pub mod hub;
pub mod types;

pub use client::RestClient;
pub use hub::Hub;
pub use types::{Client, Collection, KnowledgeArticle, NewClient, Task, TeamMember};
