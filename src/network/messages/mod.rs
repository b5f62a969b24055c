pub mod conversions;

// Generated by tonic-build from tapestry.proto; see build.rs.
pub mod tapestry;
