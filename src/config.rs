use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin/monitoring HTTP address. `None` disables the endpoint.
    pub admin_addr: Option<SocketAddr>,
    /// How many sleeping workers to wake per submitted job. 0 wakes all.
    pub try_times: usize,
    /// Session read idle timeout in milliseconds. 0 disables it.
    pub keepalive_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4730".parse().expect("valid default addr"),
            admin_addr: Some("0.0.0.0:1374".parse().expect("valid default addr")),
            try_times: 2,
            keepalive_ms: 3 * 60 * 1000,
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_admin_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.admin_addr = addr;
        self
    }

    pub fn with_try_times(mut self, try_times: usize) -> Self {
        self.try_times = try_times;
        self
    }

    pub fn with_keepalive_ms(mut self, ms: u64) -> Self {
        self.keepalive_ms = ms;
        self
    }
}
