//! Repository alias resolution.
//!
//! Aliases let morphologies say `upstream:busybox` instead of a full
//! URL. Each alias maps to a pull pattern and a push pattern, either
//! with a `%s` placeholder or as a plain prefix the repo path is
//! appended to. Unknown aliases and plain URLs pass through
//! unchanged.

use std::collections::BTreeSet;

#[derive(Debug, Clone)]
struct RepoAlias {
    alias: String,
    pull: String,
    push: String,
}

/// Resolves `alias:path` repo names to URLs and back.
#[derive(Debug, Clone, Default)]
pub struct RepoAliasResolver {
    aliases: Vec<RepoAlias>,
}

impl RepoAliasResolver {
    /// Parse alias definitions of the form `name=pull#push`.
    /// Malformed entries are ignored.
    pub fn new<S: AsRef<str>>(definitions: &[S]) -> Self {
        let mut aliases = Vec::new();
        for definition in definitions {
            let definition = definition.as_ref();
            let Some((alias, patterns)) = definition.split_once('=') else {
                continue;
            };
            let Some((pull, push)) = patterns.split_once('#') else {
                continue;
            };
            aliases.push(RepoAlias {
                alias: alias.to_string(),
                pull: pull.to_string(),
                push: push.to_string(),
            });
        }
        Self { aliases }
    }

    pub fn pull_url(&self, reponame: &str) -> String {
        self.resolve(reponame, |a| &a.pull)
    }

    pub fn push_url(&self, reponame: &str) -> String {
        self.resolve(reponame, |a| &a.push)
    }

    fn resolve<'a, F>(&'a self, reponame: &str, select: F) -> String
    where
        F: Fn(&'a RepoAlias) -> &'a String,
    {
        let Some((prefix, rest)) = reponame.split_once(':') else {
            return reponame.to_string();
        };
        // `git://…` and friends are URLs, not aliases.
        if rest.starts_with("//") {
            return reponame.to_string();
        }
        match self.aliases.iter().find(|a| a.alias == prefix) {
            Some(alias) => expand(select(alias), rest),
            None => reponame.to_string(),
        }
    }

    /// Every `alias:path` form that would resolve to the given URL,
    /// sorted. The inverse of `pull_url`/`push_url` over the defined
    /// aliases.
    pub fn aliases_from_url(&self, url: &str) -> Vec<String> {
        let mut found = BTreeSet::new();
        for alias in &self.aliases {
            for pattern in [&alias.pull, &alias.push] {
                if let Some(rest) = unexpand(pattern, url) {
                    if !rest.is_empty() {
                        found.insert(format!("{}:{}", alias.alias, rest));
                    }
                }
            }
        }
        found.into_iter().collect()
    }
}

fn expand(pattern: &str, rest: &str) -> String {
    if pattern.contains("%s") {
        pattern.replace("%s", rest)
    } else {
        format!("{pattern}{rest}")
    }
}

fn unexpand(pattern: &str, url: &str) -> Option<String> {
    match pattern.split_once("%s") {
        Some((prefix, suffix)) => {
            let middle = url.strip_prefix(prefix)?.strip_suffix(suffix)?;
            Some(middle.to_string())
        }
        None => url.strip_prefix(pattern).map(str::to_string),
    }
}
