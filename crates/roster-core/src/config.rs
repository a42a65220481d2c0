use std::collections::BTreeMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::time::Duration;

use anyhow::{
  Context,
  anyhow
};
use tracing::{
  debug,
  info,
  trace,
  warn
};

use crate::controller::DeferredDelays;
use crate::facts::{
  FACT_SCHEMA_VERSION,
  FactPolicy
};

const DEFAULTS: &[(&str, &str)] = &[
  ("api.url", "http://localhost:8080/api"),
  ("api.timeout_secs", "30"),
  ("deferred.complete.delay_ms", "5000"),
  ("deferred.unclaim.delay_ms", "4000"),
  ("deferred.resolve.delay_ms", "5000"),
  (
    "deferred.resolve_complete.delay_ms",
    "5000"
  ),
  (
    "facts.location",
    "~/.roster/facts.json"
  ),
  ("facts.ttl_hours", "720"),
  ("color", "on")
];

#[derive(Debug, Clone)]
pub struct Config {
  map:              BTreeMap<String, String>,
  pub loaded_files: Vec<PathBuf>
}

impl Default for Config {
  fn default() -> Self {
    Self {
      map:          DEFAULTS
        .iter()
        .map(|(k, v)| {
          (k.to_string(), v.to_string())
        })
        .collect(),
      loaded_files: vec![]
    }
  }
}

impl Config {
  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Config::default();

    match resolve_rc_path(rc_override)? {
      | Some(path) => {
        info!(rosterrc = %path.display(), "loading rosterrc");
        cfg.load_file(&path)?;
      }
      | None => {
        debug!(
          "no rosterrc found; using \
           defaults"
        );
      }
    }

    Ok(cfg)
  }

  #[tracing::instrument(skip(
    self, overrides
  ))]
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (k, v) in overrides {
      let key = k
        .strip_prefix("rc.")
        .unwrap_or(&k)
        .to_string();
      debug!(key = %key, value = %v, "applying override");
      self.map.insert(key, v);
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<&str> {
    self
      .map
      .get(key)
      .map(String::as_str)
      .filter(|v| !v.is_empty())
  }

  pub fn get_bool(
    &self,
    key: &str
  ) -> Option<bool> {
    self.get(key).map(parse_bool)
  }

  pub fn get_u64(
    &self,
    key: &str
  ) -> anyhow::Result<Option<u64>> {
    self
      .get(key)
      .map(|raw| {
        raw.trim().parse::<u64>().with_context(
          || {
            format!(
              "config key {key} expects \
               a whole number, got \
               {raw:?}"
            )
          }
        )
      })
      .transpose()
  }

  pub fn iter(
    &self
  ) -> impl Iterator<Item = (&String, &String)>
  {
    self.map.iter()
  }

  pub fn api_url(&self) -> &str {
    self
      .get("api.url")
      .unwrap_or(DEFAULTS[0].1)
  }

  pub fn api_timeout(
    &self
  ) -> anyhow::Result<Duration> {
    Ok(Duration::from_secs(
      self
        .get_u64("api.timeout_secs")?
        .unwrap_or(30)
    ))
  }

  /// Staff id of whoever runs the client.
  pub fn actor(&self) -> Option<&str> {
    self.get("actor").map(str::trim)
  }

  pub fn color(&self) -> bool {
    self.get_bool("color").unwrap_or(true)
  }

  pub fn deferred_delays(
    &self
  ) -> anyhow::Result<DeferredDelays> {
    let defaults =
      DeferredDelays::default();
    let delay = |key: &str,
                 fallback: Duration|
     -> anyhow::Result<Duration> {
      Ok(
        self
          .get_u64(key)?
          .map(Duration::from_millis)
          .unwrap_or(fallback)
      )
    };

    Ok(DeferredDelays {
      complete:             delay(
        "deferred.complete.delay_ms",
        defaults.complete
      )?,
      unclaim:              delay(
        "deferred.unclaim.delay_ms",
        defaults.unclaim
      )?,
      resolve:              delay(
        "deferred.resolve.delay_ms",
        defaults.resolve
      )?,
      resolve_and_complete: delay(
        "deferred.resolve_complete.\
         delay_ms",
        defaults.resolve_and_complete
      )?
    })
  }

  pub fn facts_path(&self) -> PathBuf {
    let raw = self
      .get("facts.location")
      .unwrap_or("~/.roster/facts.json");
    expand_tilde(Path::new(raw))
  }

  pub fn fact_policy(
    &self
  ) -> anyhow::Result<FactPolicy> {
    let hours = self
      .get_u64("facts.ttl_hours")?
      .unwrap_or(720);
    let hours = i64::try_from(hours)
      .map_err(|_| {
        anyhow!(
          "facts.ttl_hours is too \
           large: {hours}"
        )
      })?;
    Ok(FactPolicy {
      ttl:     chrono::Duration::hours(
        hours
      ),
      version: FACT_SCHEMA_VERSION
    })
  }

  #[tracing::instrument(skip(self))]
  fn load_file(
    &mut self,
    path: &Path
  ) -> anyhow::Result<()> {
    let path = expand_tilde(path);
    if self.loaded_files.contains(&path)
    {
      warn!(file = %path.display(), "config file already loaded; skipping include cycle");
      return Ok(());
    }
    let text =
      fs::read_to_string(&path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;

    self
      .loaded_files
      .push(path.clone());

    let base_dir = path
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_else(|| {
        PathBuf::from(".")
      });

    for (line_num, raw_line) in
      text.lines().enumerate()
    {
      let line = match raw_line
        .split_once('#')
      {
        | Some((before, _)) => before,
        | None => raw_line
      }
      .trim();
      if line.is_empty() {
        continue;
      }

      if let Some(include_rest) =
        line.strip_prefix("include ")
      {
        let include_path =
          resolve_include_path(
            &base_dir,
            include_rest.trim()
          )?;
        debug!(
          file = %path.display(),
          include = %include_path.display(),
          line = line_num + 1,
          "processing include"
        );

        if include_path.exists() {
          self
            .load_file(&include_path)?;
        } else {
          warn!(include = %include_path.display(), "include file does not exist; skipping");
        }
        continue;
      }

      let (k, v) = line
        .split_once('=')
        .ok_or_else(|| {
          anyhow!(
            "invalid config line \
             {}:{}: {}",
            path.display(),
            line_num + 1,
            raw_line
          )
        })?;

      let key = k.trim().to_string();
      let value = v.trim().to_string();
      trace!(key = %key, value = %value, "loaded config key");
      self.map.insert(key, value);
    }

    Ok(())
  }
}

#[tracing::instrument(skip(
  override_path
))]
fn resolve_rc_path(
  override_path: Option<&Path>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = override_path {
    return Ok(Some(path.to_path_buf()));
  }

  if let Ok(rc_env) =
    std::env::var("ROSTERRC")
  {
    if rc_env == "/dev/null" {
      return Ok(None);
    }
    return Ok(Some(PathBuf::from(
      rc_env
    )));
  }

  let Some(home) = dirs::home_dir()
  else {
    warn!(
      "cannot determine home \
       directory; skipping \
       ~/.rosterrc"
    );
    return Ok(None);
  };
  let candidate = home.join(".rosterrc");
  if candidate.exists() {
    return Ok(Some(candidate));
  }

  Ok(None)
}

fn resolve_include_path(
  base_dir: &Path,
  include: &str
) -> anyhow::Result<PathBuf> {
  if include.is_empty() {
    return Err(anyhow!(
      "include path cannot be empty"
    ));
  }

  let expanded =
    expand_tilde(Path::new(include));
  if expanded.is_absolute() {
    Ok(expanded)
  } else {
    Ok(base_dir.join(expanded))
  }
}

pub fn expand_tilde(
  path: &Path
) -> PathBuf {
  let text = path.to_string_lossy();
  if let Some(rest) =
    text.strip_prefix("~/")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}

pub fn parse_bool(s: &str) -> bool {
  matches!(
    s.trim()
      .to_ascii_lowercase()
      .as_str(),
    "1" | "y" | "yes" | "on" | "true"
  )
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use tempfile::tempdir;

  use super::*;

  #[test]
  fn defaults_match_undo_windows() {
    let cfg = Config::default();
    let delays = cfg
      .deferred_delays()
      .expect("defaults parse");
    assert_eq!(
      delays,
      DeferredDelays::default()
    );
    assert_eq!(
      delays.unclaim,
      Duration::from_millis(4000)
    );
    assert!(cfg.color());
    assert_eq!(cfg.actor(), None);
  }

  #[test]
  fn rc_file_with_include_and_overrides()
  {
    let dir =
      tempdir().expect("tempdir");
    let extra = dir.path().join("extra.rc");
    fs::write(
      &extra,
      "deferred.unclaim.delay_ms = \
       1500\n"
    )
    .expect("write include");

    let rc = dir.path().join("rosterrc");
    let mut file =
      fs::File::create(&rc)
        .expect("create rc");
    writeln!(file, "# team settings")
      .expect("write rc");
    writeln!(file, "actor = s-1   # me")
      .expect("write rc");
    writeln!(
      file,
      "api.url = http://tasks.internal/api"
    )
    .expect("write rc");
    writeln!(file, "include extra.rc")
      .expect("write rc");
    drop(file);

    let mut cfg = Config::load(Some(rc.as_path()))
      .expect("load rc");
    assert_eq!(cfg.loaded_files.len(), 2);
    assert_eq!(cfg.actor(), Some("s-1"));
    assert_eq!(
      cfg.api_url(),
      "http://tasks.internal/api"
    );
    assert_eq!(
      cfg
        .deferred_delays()
        .expect("delays")
        .unclaim,
      Duration::from_millis(1500)
    );

    cfg.apply_overrides([(
      "rc.color".to_string(),
      "off".to_string()
    )]);
    assert!(!cfg.color());
  }

  #[test]
  fn malformed_numbers_are_reported() {
    let mut cfg = Config::default();
    cfg.apply_overrides([(
      "deferred.complete.delay_ms"
        .to_string(),
      "soon".to_string()
    )]);
    let err = cfg
      .deferred_delays()
      .expect_err("not a number");
    assert!(
      err
        .to_string()
        .contains("deferred.complete")
    );
  }

  #[test]
  fn line_without_equals_is_rejected() {
    let dir =
      tempdir().expect("tempdir");
    let rc = dir.path().join("rosterrc");
    fs::write(&rc, "actor s-1\n")
      .expect("write rc");
    assert!(
      Config::load(Some(rc.as_path())).is_err()
    );
  }
}
