//! Clients for the services the pipeline calls out to.

pub mod fake;
pub mod places;
pub mod vapi;

pub use fake::{ScriptedCallClient, StaticPlaces};
pub use places::{GooglePlacesClient, PlaceDetails, PlaceLookup, PlaceSummary, PlacesError};
pub use vapi::{CallClient, CallError, CreateCallRequest, VapiClient};
