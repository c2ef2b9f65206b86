use crate::config::{Config, ConfigError};
use crate::location::providers::IpLocator;
use crate::location::resolver::{client_ip_locator, ResolverBuilder};
use crate::location::LocationResolver;
use chrono_tz::Tz;
use std::net::IpAddr;
use std::sync::Arc;

type LocatorFactory = Box<dyn Fn(Option<IpAddr>) -> Arc<dyn IpLocator> + Send + Sync>;

/// Shared across requests. Each request gets its own resolver stamped from
/// the template; the geocode cache behind it is shared.
pub struct AppState {
    pub template: ResolverBuilder,
    /// Builds an IP locator for the requesting client. Unset keeps the
    /// template's locator.
    pub client_locator: Option<LocatorFactory>,
    pub timezone: Tz,
}

impl AppState {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let timezone = config.display.tz()?;
        let client_config = config.clone();
        let client_locator: Option<LocatorFactory> = if config.ip.enabled {
            Some(Box::new(move |ip| client_ip_locator(&client_config, ip)))
        } else {
            None
        };
        Ok(Self {
            template: ResolverBuilder::from_config(config).without_geolocation(),
            client_locator,
            timezone,
        })
    }

    /// The server has no device of its own; only the IP tier runs unattended.
    pub fn resolver_for(&self, client: Option<IpAddr>) -> LocationResolver {
        let mut builder = self.template.clone().without_geolocation();
        if let Some(make) = &self.client_locator {
            builder = builder.ip_locator(make(client));
        }
        builder.build()
    }
}
