//! Default resource sampler.
//!
//! Reading `/proc`, libvirt, and the storage subsystem is infrastructure
//! the core depends on but does not implement; this sampler reports a
//! node with no load as a placeholder until a real one is wired in.

use async_trait::async_trait;
use hyperfence_cluster::ResourceSampler;
use hyperfence_types::Resources;

pub struct ZeroedResourceSampler;

#[async_trait]
impl ResourceSampler for ZeroedResourceSampler {
    async fn sample(&self) -> Resources {
        Resources::zeroed()
    }
}
