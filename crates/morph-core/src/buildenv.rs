//! The clean environment chunks are built in.
//!
//! Builds run with a fixed, minimal environment so that host
//! configuration cannot leak into artifacts. A short whitelist of
//! variables is copied from the host (fakeroot and distcc need
//! theirs), everything else is overridden.

use crate::settings::Settings;
use std::collections::BTreeMap;

const COPIED_VARS: [&str; 6] = [
    "DISTCC_HOSTS",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "FAKEROOTKEY",
    "FAKED_MODE",
    "FAKEROOT_FD_BASE",
];

const CCACHE_PATH: &str = "/usr/lib/ccache";
const OVERRIDE_HOME: &str = "/tmp";
const OVERRIDE_LOCALE: &str = "C";
const OVERRIDE_SHELL: &str = "/bin/sh";
const OVERRIDE_TERM: &str = "dumb";
const OVERRIDE_USERNAME: &str = "tomjon";

/// Environment and PATH extensions for one build run.
#[derive(Debug, Clone)]
pub struct BuildEnvironment {
    pub arch: String,
    pub env: BTreeMap<String, String>,
    pub extra_path: Vec<String>,
}

impl BuildEnvironment {
    pub fn new(settings: &Settings, arch: &str) -> Self {
        Self::with_host_env(settings, arch, &host_env())
    }

    /// Like [`BuildEnvironment::new`] with an explicit host
    /// environment, so tests do not depend on the process env.
    pub fn with_host_env(
        settings: &Settings,
        arch: &str,
        host: &BTreeMap<String, String>,
    ) -> Self {
        let mut env = BTreeMap::new();
        let mut extra_path = Vec::new();

        for name in COPIED_VARS {
            if let Some(value) = host.get(name) {
                env.insert(name.to_string(), value.clone());
            }
        }

        env.insert("TERM".to_string(), OVERRIDE_TERM.to_string());
        env.insert("SHELL".to_string(), OVERRIDE_SHELL.to_string());
        env.insert("USER".to_string(), OVERRIDE_USERNAME.to_string());
        env.insert("USERNAME".to_string(), OVERRIDE_USERNAME.to_string());
        env.insert("LOGNAME".to_string(), OVERRIDE_USERNAME.to_string());
        env.insert("LC_ALL".to_string(), OVERRIDE_LOCALE.to_string());
        env.insert("HOME".to_string(), OVERRIDE_HOME.to_string());
        env.insert("PREFIX".to_string(), settings.prefix.clone());
        env.insert("BOOTSTRAP".to_string(), "false".to_string());

        env.insert("MORPH_ARCH".to_string(), arch.to_string());
        env.insert("TARGET".to_string(), format!("{arch}-baserock-linux-gnu"));
        env.insert(
            "TARGET_STAGE1".to_string(),
            format!("{arch}-bootstrap-linux-gnu"),
        );

        if !settings.no_ccache {
            extra_path.push(CCACHE_PATH.to_string());
            env.insert("CCACHE_DIR".to_string(), "/tmp/ccache".to_string());
            env.insert("CCACHE_EXTRAFILES".to_string(), String::new());
            if !settings.no_distcc {
                env.insert("CCACHE_PREFIX".to_string(), "distcc".to_string());
            }
        }

        Self {
            arch: arch.to_string(),
            env,
            extra_path,
        }
    }
}

fn host_env() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn overrides_are_fixed() {
        let env = BuildEnvironment::with_host_env(&settings(), "x86_64", &BTreeMap::new());
        assert_eq!(env.env["TERM"], "dumb");
        assert_eq!(env.env["SHELL"], "/bin/sh");
        assert_eq!(env.env["USER"], "tomjon");
        assert_eq!(env.env["USERNAME"], "tomjon");
        assert_eq!(env.env["LOGNAME"], "tomjon");
        assert_eq!(env.env["LC_ALL"], "C");
        assert_eq!(env.env["HOME"], "/tmp");
        assert_eq!(env.env["BOOTSTRAP"], "false");
        assert_eq!(env.env["MORPH_ARCH"], "x86_64");
    }

    #[test]
    fn whitelisted_host_vars_are_copied() {
        let mut host = BTreeMap::new();
        host.insert("DISTCC_HOSTS".to_string(), "builder1 builder2".to_string());
        host.insert("PATH".to_string(), "/host/bin".to_string());
        host.insert("EDITOR".to_string(), "ed".to_string());

        let env = BuildEnvironment::with_host_env(&settings(), "x86_64", &host);
        assert_eq!(env.env["DISTCC_HOSTS"], "builder1 builder2");
        assert!(!env.env.contains_key("EDITOR"));
        // PATH is composed by the staging area, never inherited here.
        assert!(!env.env.contains_key("PATH"));
    }

    #[test]
    fn ccache_knobs_follow_settings() {
        let mut s = settings();
        let env = BuildEnvironment::with_host_env(&s, "x86_64", &BTreeMap::new());
        assert_eq!(env.env["CCACHE_DIR"], "/tmp/ccache");
        // distcc is off by default, so ccache runs plain.
        assert!(!env.env.contains_key("CCACHE_PREFIX"));
        assert_eq!(env.extra_path, vec!["/usr/lib/ccache"]);

        s.no_distcc = false;
        let env = BuildEnvironment::with_host_env(&s, "x86_64", &BTreeMap::new());
        assert_eq!(env.env["CCACHE_PREFIX"], "distcc");

        s.no_ccache = true;
        let env = BuildEnvironment::with_host_env(&s, "x86_64", &BTreeMap::new());
        assert!(!env.env.contains_key("CCACHE_DIR"));
        assert!(env.extra_path.is_empty());
    }

    #[test]
    fn prefix_comes_from_settings() {
        let mut s = settings();
        s.prefix = "/opt/morph".to_string();
        let env = BuildEnvironment::with_host_env(&s, "x86_64", &BTreeMap::new());
        assert_eq!(env.env["PREFIX"], "/opt/morph");
    }
}
