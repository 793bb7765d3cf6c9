//! Tracked heads - the fixed set of (repository, branch) pairs this daemon mirrors
//!
//! The registry is read once from configuration and never changes for the
//! lifetime of the process. Enumeration order is configuration order.

use anyhow::{anyhow, bail, Result};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A tracked `(repository, branch)` pair, the unit of synchronization
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Head {
    pub repo: String,
    pub branch: String,
}

impl Head {
    pub fn new(repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            branch: branch.into(),
        }
    }

    /// Stable string key, used to name hint and state files
    pub fn key(&self) -> String {
        format!("{}:{}", self.repo, self.branch)
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repo, self.branch)
    }
}

impl FromStr for Head {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (repo, branch) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("Head key '{}' is not of the form <repo>:<branch>", s))?;

        if repo.is_empty() || branch.is_empty() {
            bail!("Head key '{}' has an empty repository or branch", s);
        }

        Ok(Head::new(repo, branch))
    }
}

/// Ordered mapping from repository name to its tracked branches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoRegistry {
    repos: Vec<(String, Vec<String>)>,
}

impl RepoRegistry {
    /// Build a registry, rejecting duplicate repositories and branches
    pub fn new<R, B>(repos: impl IntoIterator<Item = (R, B)>) -> Result<Self>
    where
        R: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        let mut registry = Self::default();

        for (repo, branches) in repos {
            let repo: String = repo.into();
            if repo.is_empty() || repo.contains(&[':', '/'][..]) || repo == "." || repo == ".." {
                bail!("Invalid repository name '{}'", repo);
            }
            if registry.repos.iter().any(|(name, _)| *name == repo) {
                bail!("Repository '{}' is listed more than once", repo);
            }

            let mut tracked: Vec<String> = Vec::new();
            for branch in branches {
                let branch: String = branch.into();
                if branch.is_empty() {
                    bail!("Repository '{}' lists an empty branch name", repo);
                }
                // Keys double as relative paths under the hint and state directories
                if branch
                    .split('/')
                    .any(|part| part.is_empty() || part == "." || part == "..")
                {
                    bail!("Invalid branch name '{}' for '{}'", branch, repo);
                }
                if tracked.contains(&branch) {
                    bail!("Branch '{}' of '{}' is listed more than once", branch, repo);
                }
                tracked.push(branch);
            }

            registry.repos.push((repo, tracked));
        }

        Ok(registry)
    }

    /// All heads in configuration order
    pub fn heads(&self) -> impl Iterator<Item = Head> + '_ {
        self.repos.iter().flat_map(|(repo, branches)| {
            branches.iter().map(move |branch| Head::new(repo.as_str(), branch.as_str()))
        })
    }

    pub fn contains(&self, head: &Head) -> bool {
        self.repos
            .iter()
            .any(|(repo, branches)| *repo == head.repo && branches.contains(&head.branch))
    }

    /// Number of tracked heads
    pub fn len(&self) -> usize {
        self.repos.iter().map(|(_, branches)| branches.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// A YAML mapping visitor keeps document order, which a HashMap would lose.
impl<'de> Deserialize<'de> for RepoRegistry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RegistryVisitor;

        impl<'de> Visitor<'de> for RegistryVisitor {
            type Value = RepoRegistry;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of repository names to lists of branches")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<RepoRegistry, A::Error> {
                let mut entries: Vec<(String, Vec<String>)> = Vec::new();
                while let Some((repo, branches)) = map.next_entry::<String, Vec<String>>()? {
                    entries.push((repo, branches));
                }
                RepoRegistry::new(entries).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_map(RegistryVisitor)
    }
}

impl Serialize for RepoRegistry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.repos.len()))?;
        for (repo, branches) in &self.repos {
            map.serialize_entry(repo, branches)?;
        }
        map.end()
    }
}
