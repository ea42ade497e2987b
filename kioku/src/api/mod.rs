pub mod review;
pub mod sync;

#[cfg(test)]
mod tests;

/// Replica id the server stamps its own writes with. Client replica ids are
/// UUIDs, so this never collides and sorts after most of them on ties.
pub const SERVER_REPLICA_ID: &str = "server";
