// labelq Control Plane Library
// Decision: routes and backend wiring live in the library so tests can build the app

pub mod api;
pub mod backend;
