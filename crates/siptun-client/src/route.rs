//! Current traffic route, published to the media and signaling hot paths

use crate::links::LinkSet;
use arc_swap::ArcSwap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub enum Route {
    /// Traffic uses the host's own sockets
    #[default]
    Direct,
    /// Traffic goes through these links
    Tunneled(Arc<LinkSet>),
}

impl Route {
    pub fn is_tunneled(&self) -> bool {
        matches!(self, Route::Tunneled(_))
    }
}

/// Written by the pump, read lock-free by every transport
pub type SharedRoute = Arc<ArcSwap<Route>>;

pub fn direct_route() -> SharedRoute {
    Arc::new(ArcSwap::from_pointee(Route::Direct))
}
