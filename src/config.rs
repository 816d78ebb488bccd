use camino::Utf8Path;
use config::{Config, ConfigError};

pub use lightscene_api::config::*;

pub fn parse(filename: &Utf8Path) -> Result<AppConfig, ConfigError> {
    let settings = Config::builder()
        .set_default("hass.token_env", HassServer::DEFAULT_TOKEN_ENV)?
        .set_default(
            "lightscene.reproduce_timeout_secs",
            LightSceneConfig::DEFAULT_REPRODUCE_TIMEOUT_SECS,
        )?
        .set_default(
            "lightscene.reload_delay_secs",
            LightSceneConfig::DEFAULT_RELOAD_DELAY_SECS,
        )?
        .add_source(config::File::with_name(filename.as_str()))
        .build()?;

    settings.try_deserialize()
}
