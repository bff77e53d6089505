//! The lifecycle contract every Spawner/Summoner child implements (spec
//! §4.5/§4.6). Destruction is async because most children own a bus
//! subscription, watcher, or timer that must be awaited to a clean stop.

use std::future::Future;

pub trait Destroy: Send {
    fn destroy(self) -> impl Future<Output = ()> + Send;
}
