pub mod github;
pub mod jenkins;
pub mod llm;
pub mod slack;
pub mod web;
