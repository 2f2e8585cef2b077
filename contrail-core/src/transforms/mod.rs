//! Per-record transforms for the flight itinerary stages.
//!
//! These are the business half of a [StageWorker](crate::worker::StageWorker):
//! plain functions matching the transform contract. Malformed rows surface as
//! [FieldError]s and get dropped by the worker, never aborting the stage.
use crate::types::{FieldError, Record};

/// Airport the itinerary starts at
pub const STARTING_AIRPORT: &str = "startingAirport";
/// `||`-separated arrival airports of the itinerary's segments
pub const SEGMENT_ARRIVALS: &str = "segmentsArrivalAirportCode";
/// Derived full route, `||`-separated including the starting airport
pub const ROUTE: &str = "route";
/// Derived count of intermediate stops
pub const TOTAL_STOPOVERS: &str = "totalStopovers";
/// Total price of the itinerary
pub const TOTAL_FARE: &str = "totalFare";

/// Separator between airports in a route string
const ROUTE_SEPARATOR: &str = "||";

/// Derive `route` and `totalStopovers` from the starting airport and the
/// segment arrival list.
///
/// `startingAirport = FRA`, `segmentsArrivalAirportCode = CDG||EZE` yields
/// `route = FRA||CDG||EZE` with one stopover.
pub fn derive_route(record: &Record) -> Result<Option<Record>, FieldError> {
    let starting = record.get_str(STARTING_AIRPORT)?;
    let segments = record.get_str(SEGMENT_ARRIVALS)?;
    let stopovers = segments.split(ROUTE_SEPARATOR).count() as i32 - 1;
    let route = format!("{starting}{ROUTE_SEPARATOR}{segments}");

    let mut out = record.clone();
    out.set_str(ROUTE, &route);
    out.set_int(TOTAL_STOPOVERS, stopovers);
    Ok(Some(out))
}

/// A filter keeping only itineraries with at least `limit` stopovers
pub fn min_stopovers(limit: i32) -> impl FnMut(&Record) -> Result<Option<Record>, FieldError> {
    move |record| {
        let stopovers = record.get_int(TOTAL_STOPOVERS)?;
        if stopovers >= limit {
            Ok(Some(record.clone()))
        } else {
            Ok(None)
        }
    }
}
