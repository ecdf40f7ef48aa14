//! Scenario tests
//!
//! Each file drives one or more `SyncEngine`s against a shared
//! `MemoryBackend`.

mod membership_test;
mod presence_test;
mod reactions_test;
mod reconnect_test;
mod send_test;
