// ABOUTME: Test doubles for exercising backends without real agent binaries.
// ABOUTME: FakePeer scripts the far end of a stdio pipe, FakeLauncher hands peers to backends.

pub mod fake_launcher;
pub mod fake_peer;

pub use fake_launcher::FakeLauncher;
pub use fake_peer::FakePeer;
