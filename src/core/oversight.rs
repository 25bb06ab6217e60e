//! Oversight: activate / enforce / disregard governance over resource facets.
//!
//! An oversight is brought into force for a flow by the nodes it governs.
//! While in force, the first time a governed resource becomes ready inside
//! the flow its facet is activated under the oversight. The resulting
//! activation set is later resolved exactly once: enforced when the flow
//! completes cleanly, disregarded when anything in it fails or it is
//! cancelled. A resolved set is discarded; later activations start a new one.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::core::failure::{Failure, FailureOrigin};
use crate::core::resource::{Facet, ResourceContainer, ResourceKey};

/// Identifier of an oversight within a flow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OversightId(pub(crate) usize);

/// Behaviour of an oversight.
pub trait Governance: Send + Sync + 'static {
    /// A governed facet joined the activation set.
    ///
    /// # Errors
    ///
    /// A failure here fails the unit that loaded the resource.
    fn activate(&self, _facet: &Facet) -> Result<(), Failure> {
        Ok(())
    }

    /// Commit every activated facet.
    ///
    /// # Errors
    ///
    /// A failure is escalated like any other; the set is still resolved.
    fn enforce(&self, facets: &[Facet]) -> Result<(), Failure>;

    /// Compensate every activated facet.
    fn disregard(&self, facets: &[Facet]);
}

/// Definition of one oversight in a flow graph.
#[derive(Clone)]
pub struct OversightDef {
    pub(crate) id: OversightId,
    pub(crate) name: Arc<str>,
    pub(crate) governance: Arc<dyn Governance>,
    pub(crate) governs: Vec<ResourceKey>,
}

impl OversightDef {
    /// Oversight id.
    #[must_use]
    pub const fn id(&self) -> OversightId {
        self.id
    }

    /// Oversight name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resources this oversight governs.
    #[must_use]
    pub fn governs(&self) -> &[ResourceKey] {
        &self.governs
    }
}

impl fmt::Debug for OversightDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OversightDef")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("governs", &self.governs)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct ActivationSet {
    containers: HashSet<Uuid>,
    facets: Vec<Facet>,
}

/// An activation set taken out of the manager, ready to resolve.
pub struct PendingResolution {
    def: OversightDef,
    facets: Vec<Facet>,
}

impl PendingResolution {
    /// Oversight being resolved.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Number of facets in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.facets.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.facets.is_empty()
    }

    /// Commit the set.
    ///
    /// # Errors
    ///
    /// Returns the governance failure stamped with this oversight's origin.
    pub fn enforce(self) -> Result<(), Failure> {
        self.def.governance.enforce(&self.facets).map_err(|failure| {
            failure.originating(FailureOrigin::Oversight {
                oversight: self.def.name.to_string(),
            })
        })
    }

    /// Compensate the set.
    pub fn disregard(self) {
        self.def.governance.disregard(&self.facets);
    }
}

/// Oversight state of one flow.
pub struct OversightManager {
    defs: Arc<[OversightDef]>,
    in_force: Vec<bool>,
    active: Vec<Option<ActivationSet>>,
}

impl OversightManager {
    /// Manager with nothing in force.
    #[must_use]
    pub fn new(defs: Arc<[OversightDef]>) -> Self {
        let in_force = vec![false; defs.len()];
        let active = defs.iter().map(|_| None).collect();
        Self { defs, in_force, active }
    }

    /// Bring an oversight into force for this flow.
    pub fn bring_into_force(&mut self, id: OversightId) {
        if let Some(flag) = self.in_force.get_mut(id.0) {
            *flag = true;
        }
    }

    /// Whether the oversight is in force.
    #[must_use]
    pub fn is_in_force(&self, id: OversightId) -> bool {
        self.in_force.get(id.0).copied().unwrap_or(false)
    }

    /// Activate `container`'s facet under `id`. Idempotent per container;
    /// returns whether the facet newly joined the set. Containers without a
    /// facet (or not ready) are skipped.
    ///
    /// # Errors
    ///
    /// Fails for an unknown oversight or when its `activate` fails.
    pub fn activate(&mut self, id: OversightId, container: &ResourceContainer) -> Result<bool, Failure> {
        let def = self
            .defs
            .get(id.0)
            .ok_or_else(|| Failure::runtime(format!("unknown oversight #{}", id.0)))?;
        let set = self.active[id.0].get_or_insert_with(ActivationSet::default);
        if set.containers.contains(&container.id()) {
            return Ok(false);
        }
        let Some(facet) = container.facet() else {
            return Ok(false);
        };
        def.governance.activate(&facet).map_err(|failure| {
            failure.originating(FailureOrigin::Oversight {
                oversight: def.name.to_string(),
            })
        })?;
        set.containers.insert(container.id());
        set.facets.push(facet);
        Ok(true)
    }

    /// Activate `container` under every in-force oversight in `governing`.
    ///
    /// # Errors
    ///
    /// Stops at the first failing activation.
    pub fn activate_governing(
        &mut self,
        governing: &[OversightId],
        container: &ResourceContainer,
    ) -> Result<(), Failure> {
        for id in governing {
            if self.is_in_force(*id) {
                self.activate(*id, container)?;
            }
        }
        Ok(())
    }

    /// Number of facets currently activated under `id`.
    #[must_use]
    pub fn activated(&self, id: OversightId) -> usize {
        self.active
            .get(id.0)
            .and_then(Option::as_ref)
            .map_or(0, |set| set.facets.len())
    }

    /// Take every non-empty activation set out of the manager. Each set can
    /// be taken once, which is what makes resolution exactly-once.
    pub fn take_all(&mut self) -> Vec<PendingResolution> {
        let defs = Arc::clone(&self.defs);
        self.active
            .iter_mut()
            .zip(defs.iter())
            .filter_map(|(slot, def)| {
                let set = slot.take()?;
                (!set.facets.is_empty()).then(|| PendingResolution {
                    def: def.clone(),
                    facets: set.facets,
                })
            })
            .collect()
    }
}
