//! # Routing
//!
//! Filter-based fan-out of published messages to subscriptions.

pub mod router;

pub use router::{
    DeliveryCoreLookup, RoutePlan, RoutedDelivery, SingleCoreLookup, SubscriptionRouter,
};
