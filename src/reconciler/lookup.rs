//! Reference resolution
//!
//! Turns [`Reference`]s into remote entities. A lookup that matches nothing
//! is `ReferenceNotFound`; one that matches several is `ReferenceAmbiguous`.
//! Nothing is ever picked arbitrarily.

use crate::domain::ports::{ClusterApi, ProtectionDomain, Sdc, StoragePool, Volume};
use crate::domain::Reference;
use crate::error::{Error, Result};
use std::future::Future;
use tracing::debug;

/// Id of the single system behind the session
pub async fn system_id(api: &dyn ClusterApi) -> Result<String> {
    let mut systems = api.list_systems().await?;
    match systems.len() {
        0 => Err(Error::Configuration("no systems found".into())),
        1 => Ok(systems.remove(0).id),
        _ => Err(Error::Configuration("more than one system found".into())),
    }
}

/// Reduce a match list to its only element
pub fn select_one<T>(kind: &str, reference: &Reference, mut matches: Vec<T>) -> Result<T> {
    match matches.len() {
        0 => Err(Error::ReferenceNotFound {
            kind: kind.to_string(),
            reference: reference.to_string(),
        }),
        1 => Ok(matches.remove(0)),
        n => Err(Error::ReferenceAmbiguous {
            kind: kind.to_string(),
            reference: reference.to_string(),
            matches: n,
        }),
    }
}

fn unsupported(kind: &str, reference: &Reference) -> Error {
    Error::validation(format!("{kind} cannot be referenced by {reference}"))
}

/// A by-id get that misses becomes a reference error
fn by_id<T>(kind: &str, reference: &Reference, result: Result<T>) -> Result<T> {
    match result {
        Err(Error::NotFound { .. }) => Err(Error::ReferenceNotFound {
            kind: kind.to_string(),
            reference: reference.to_string(),
        }),
        other => other,
    }
}

pub async fn resolve_protection_domain(
    api: &dyn ClusterApi,
    reference: &Reference,
) -> Result<ProtectionDomain> {
    const KIND: &str = "ProtectionDomain";
    match reference {
        Reference::ById(id) => by_id(KIND, reference, api.get_protection_domain(id).await),
        Reference::ByName(name) => {
            let matches = api
                .list_protection_domains()
                .await?
                .into_iter()
                .filter(|pd| &pd.name == name)
                .collect();
            select_one(KIND, reference, matches)
        }
        Reference::ByKey(_) => Err(unsupported(KIND, reference)),
    }
}

/// Resolve a storage pool inside one protection domain
pub async fn resolve_storage_pool(
    api: &dyn ClusterApi,
    protection_domain_id: &str,
    reference: &Reference,
) -> Result<StoragePool> {
    const KIND: &str = "StoragePool";
    match reference {
        Reference::ById(id) => {
            let pool = by_id(KIND, reference, api.get_storage_pool(id).await)?;
            if pool.protection_domain_id != protection_domain_id {
                return Err(Error::ReferenceNotFound {
                    kind: KIND.to_string(),
                    reference: format!("{reference} in protection domain {protection_domain_id}"),
                });
            }
            Ok(pool)
        }
        Reference::ByName(name) => {
            let matches = api
                .list_storage_pools(protection_domain_id)
                .await?
                .into_iter()
                .filter(|p| &p.name == name)
                .collect();
            select_one(KIND, reference, matches)
        }
        Reference::ByKey(_) => Err(unsupported(KIND, reference)),
    }
}

pub async fn resolve_volume(api: &dyn ClusterApi, reference: &Reference) -> Result<Volume> {
    const KIND: &str = "Volume";
    match reference {
        Reference::ById(id) => by_id(KIND, reference, api.get_volume(id).await),
        Reference::ByName(name) => {
            let matches = api
                .list_volumes()
                .await?
                .into_iter()
                .filter(|v| &v.name == name)
                .collect();
            select_one(KIND, reference, matches)
        }
        Reference::ByKey(_) => Err(unsupported(KIND, reference)),
    }
}

/// Resolve an SDC by id, by IP (its natural key) or by name
pub async fn resolve_sdc(api: &dyn ClusterApi, reference: &Reference) -> Result<Sdc> {
    const KIND: &str = "Sdc";
    match reference {
        Reference::ById(id) => by_id(KIND, reference, api.get_sdc(id).await),
        Reference::ByKey(ip) => {
            let matches = api
                .list_sdcs()
                .await?
                .into_iter()
                .filter(|s| &s.sdc_ip == ip)
                .collect();
            select_one(KIND, reference, matches)
        }
        Reference::ByName(name) => {
            let matches = api
                .list_sdcs()
                .await?
                .into_iter()
                .filter(|s| s.name.as_deref() == Some(name.as_str()))
                .collect();
            select_one(KIND, reference, matches)
        }
    }
}

/// Priority order of candidate filters: id, then natural key, then name
pub fn priority_candidates(id: Option<&str>, key: Option<&str>, name: Option<&str>) -> Vec<Reference> {
    [
        id.filter(|s| !s.is_empty()).map(Reference::id),
        key.filter(|s| !s.is_empty()).map(Reference::key),
        name.filter(|s| !s.is_empty()).map(Reference::name),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Try candidates in order and stop at the first that resolves to exactly one entity
///
/// When none does, the result is `ReferenceAmbiguous` if any candidate matched
/// several entities, otherwise `ReferenceNotFound`. Errors other than the two
/// reference errors abort the search.
pub async fn first_unique<T, F, Fut>(kind: &str, candidates: Vec<Reference>, mut resolve: F) -> Result<T>
where
    F: FnMut(Reference) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if candidates.is_empty() {
        return Err(Error::validation(format!("no {kind} filter given")));
    }
    let tried = candidates
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    let mut ambiguous: Option<Error> = None;
    for candidate in candidates {
        let shown = candidate.to_string();
        match resolve(candidate).await {
            Ok(entity) => return Ok(entity),
            Err(Error::ReferenceNotFound { .. }) => {
                debug!("{} filter {} matched nothing", kind, shown);
            }
            Err(e @ Error::ReferenceAmbiguous { .. }) => {
                debug!("{} filter {} is ambiguous", kind, shown);
                if ambiguous.is_none() {
                    ambiguous = Some(e);
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(ambiguous.unwrap_or(Error::ReferenceNotFound {
        kind: kind.to_string(),
        reference: tried,
    }))
}

/// Whether a reference designates the entity with this id and name
pub fn reference_matches(reference: &Reference, id: &str, name: &str) -> bool {
    match reference {
        Reference::ById(v) => v == id,
        Reference::ByName(v) => v == name,
        Reference::ByKey(_) => false,
    }
}
