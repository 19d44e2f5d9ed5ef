//! Default values for configuration sections

pub const DEFAULT_HOST: &str = "0.0.0.0";

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;
pub const DEFAULT_CONTAINER_HTTP_PORT: u16 = 8080;
pub const DEFAULT_CONTAINER_HTTPS_PORT: u16 = 8443;

pub const DEFAULT_PLUGIN_LISTEN: &str = "127.0.0.1:8081";

pub const DEFAULT_ACME_CACHE_DIR: &str = "./var/acme";

pub const DEFAULT_FILE_PATH: &str = "reproxy.yml";

pub const DEFAULT_DOCKER_ENDPOINT: &str = "unix:///var/run/docker.sock";

pub const DEFAULT_CONSUL_ADDRESS: &str = "http://127.0.0.1:8500";

/// Environment variable signalling that the proxy runs inside a container;
/// switches the default listen ports to their unprivileged variants.
pub const IN_CONTAINER_ENV: &str = "REPROXY_IN_DOCKER";
