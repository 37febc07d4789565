// Private dispatch endpoint
pub mod api;

// Agent runtime invocation with bounded timeout
pub mod runner;
