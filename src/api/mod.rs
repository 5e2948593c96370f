pub mod context;
pub mod routes;

#[cfg(test)]
mod tests;

// Re-export route handlers for convenience
pub use routes::images;
pub use routes::map;
pub use routes::markers;
pub use routes::state::AppState;
pub use routes::visits;
