/// Parameters governing a slave's behaviour
///
/// Default values are suitable for most deployments; typically only the
/// slave id needs choosing.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) slave_id: u64,
    pub(crate) mtu: Option<usize>,
    pub(crate) rng_seed: Option<u64>,
}

impl Config {
    /// Configuration for the slave with the given unique id
    pub fn new(slave_id: u64) -> Self {
        Self {
            slave_id,
            mtu: None,
            rng_seed: None,
        }
    }

    /// Cap the negotiated MTU below what the link supports
    ///
    /// The effective MTU is never above the link's own; masters may lower it
    /// further during association.
    pub fn mtu(&mut self, mtu: usize) -> &mut Self {
        self.mtu = Some(mtu);
        self
    }

    /// Seed the retransmission jitter deterministically, for tests
    pub fn rng_seed(&mut self, seed: u64) -> &mut Self {
        self.rng_seed = Some(seed);
        self
    }
}
