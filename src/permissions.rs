//! Declarative, least-privilege-by-default permission model.
//!
//! A [`PermissionSet`] maps Deno permission categories to grants and is
//! serialized into `--allow-*` launch flags when the worker process is
//! spawned. Absent categories are denied — never the other way around.
//! Once a process is launched with a set, that set is immutable for the
//! process's lifetime; narrowing for individual execution handles is an
//! intersection check, a handle can never widen its session's grants.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VmError};

/// Deno permission categories.
///
/// Variants are declared in alphabetical order; `BTreeMap` iteration
/// therefore matches sorted-by-name order, which keeps launch arguments
/// deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionKind {
    Env,
    Ffi,
    Net,
    Read,
    Run,
    Sys,
    Write,
}

impl PermissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionKind::Env => "env",
            PermissionKind::Ffi => "ffi",
            PermissionKind::Net => "net",
            PermissionKind::Read => "read",
            PermissionKind::Run => "run",
            PermissionKind::Sys => "sys",
            PermissionKind::Write => "write",
        }
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a category is granted: everything, or an ordered list of scopes
/// (hosts for `net`, paths for `read`/`write`/`ffi`/`run`, names for
/// `env`/`sys`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Grant {
    /// `true` in config form. (`false` is rejected at validation; deny
    /// is expressed by omitting the category.)
    All(bool),
    List(Vec<String>),
}

/// A capability configuration for one worker process or one execution
/// handle. The default value grants nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet {
    grants: BTreeMap<PermissionKind, Grant>,
}

impl PermissionSet {
    /// The empty, fully-denied set.
    pub fn none() -> Self {
        Self::default()
    }

    /// Grants every scope in a category.
    pub fn allow_all(mut self, kind: PermissionKind) -> Self {
        self.grants.insert(kind, Grant::All(true));
        self
    }

    /// Grants an explicit scope list for a category, replacing any
    /// previous grant for it.
    pub fn allow(mut self, kind: PermissionKind, scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.grants.insert(
            kind,
            Grant::List(scopes.into_iter().map(Into::into).collect()),
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn grant(&self, kind: PermissionKind) -> Option<&Grant> {
        self.grants.get(&kind)
    }

    /// Checks scope shapes. Runs before any process I/O, so a rejected
    /// set costs nothing.
    pub fn validate(&self) -> Result<()> {
        for (kind, grant) in &self.grants {
            match grant {
                Grant::All(true) => {}
                Grant::All(false) => {
                    return Err(VmError::Validation(format!(
                        "{kind}: use an absent category to deny, not `false`"
                    )));
                }
                Grant::List(scopes) => {
                    if scopes.is_empty() {
                        return Err(VmError::Validation(format!(
                            "{kind}: empty scope list (omit the category to deny)"
                        )));
                    }
                    for scope in scopes {
                        validate_scope(*kind, scope)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Serializes the set into worker launch flags: `--allow-net`,
    /// `--allow-read=/a,/b`, … Deterministic: categories in name order,
    /// scopes in insertion order, so equal sets always produce
    /// byte-identical argument lists.
    pub fn to_launch_args(&self) -> Vec<String> {
        self.grants
            .iter()
            .map(|(kind, grant)| match grant {
                Grant::All(_) => format!("--allow-{kind}"),
                Grant::List(scopes) => format!("--allow-{kind}={}", scopes.join(",")),
            })
            .collect()
    }

    /// True when every grant in `self` is covered by `other`. Used at
    /// handle creation: a handle's set must be a subset of its
    /// session's.
    pub fn is_subset_of(&self, other: &PermissionSet) -> bool {
        self.grants.iter().all(|(kind, grant)| {
            match (grant, other.grants.get(kind)) {
                (_, Some(Grant::All(true))) => true,
                (Grant::List(scopes), Some(Grant::List(allowed))) => {
                    scopes.iter().all(|s| allowed.contains(s))
                }
                // Requesting allow-all, or a category the session does
                // not grant at all.
                _ => false,
            }
        })
    }

    /// Explains the first escalation found, for error messages.
    pub(crate) fn first_escalation(&self, session: &PermissionSet) -> Option<String> {
        for (kind, grant) in &self.grants {
            match (grant, session.grants.get(kind)) {
                (_, Some(Grant::All(true))) => {}
                (Grant::List(scopes), Some(Grant::List(allowed))) => {
                    if let Some(s) = scopes.iter().find(|s| !allowed.contains(s)) {
                        return Some(format!("scope {s:?} is not in the session's {kind} grant"));
                    }
                }
                (Grant::All(_), _) => {
                    return Some(format!("allow-all {kind} exceeds the session's grant"));
                }
                (Grant::List(_), _) => {
                    return Some(format!("the session grants no {kind} permission"));
                }
            }
        }
        None
    }
}

fn validate_scope(kind: PermissionKind, scope: &str) -> Result<()> {
    if scope.is_empty() || scope.contains('\n') {
        return Err(VmError::Validation(format!("{kind}: empty or malformed scope")));
    }
    if kind == PermissionKind::Net {
        // host or host:port
        let (host, port) = match scope.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (scope, None),
        };
        if host.is_empty() {
            return Err(VmError::Validation(format!("net: missing host in {scope:?}")));
        }
        if let Some(port) = port {
            if port.parse::<u16>().is_err() {
                return Err(VmError::Validation(format!("net: invalid port in {scope:?}")));
            }
        }
    }
    Ok(())
}
