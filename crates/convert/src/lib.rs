//! Tether convert: translation between the legacy and storage schema
//! versions.
//!
//! A conversion runs in two phases. `resolve` performs every store lookup
//! and yields a [`Plan`]; `materialize` builds the converted object from the
//! plan without touching the store. A lookup that fails aborts the whole
//! conversion before anything is built.

#![forbid(unsafe_code)]

pub mod review;

use std::str::FromStr;
use std::sync::Arc;

use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_core::kinds::{self, Link, ManagedSpec, ReferencableKind, TypedLink};
use tether_core::{api_version, v1alpha1, version_of, Kind, Object, Reference, StoreError, LEGACY_VERSION, STORAGE_VERSION};
use tether_resolve::{extract, ReferenceError, ResolutionRequest, Resolver};
use tether_store::Store;
use tracing::debug;

pub use review::{review, ConversionRequest, ConversionResponse, ConversionReview, ConversionResult};

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("unknown version {0}")]
    UnknownVersion(String),
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("cannot resolve {field}: {source}")]
    Unresolved {
        field: String,
        #[source]
        source: ReferenceError,
    },
    #[error("malformed object: {0}")]
    Malformed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Which value of a target the legacy schema holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Want {
    Id,
    Name,
}

impl Want {
    fn extract(self) -> tether_resolve::ExtractFn {
        match self {
            Want::Id => extract::external_id,
            Want::Name => extract::external_name,
        }
    }
}

/// Everything phase one looked up, with the decoded source spec.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Same shape in both versions; only `apiVersion` changes.
    Relabel,
    RepositoryUp { spec: ManagedSpec<v1alpha1::GitRepositoryParams>, project: Reference },
    PipelineUp { spec: ManagedSpec<v1alpha1::PipelineParams>, project: Reference, repository: Reference },
    PermissionUp {
        spec: ManagedSpec<v1alpha1::PipelinePermissionParams>,
        project: Reference,
        resource: (ReferencableKind, Reference),
        pipelines: Vec<Reference>,
    },
    RepositoryDown { spec: ManagedSpec<kinds::GitRepositoryParams>, project: String },
    PipelineDown { spec: ManagedSpec<kinds::PipelineParams>, project: String, repository: String },
    PermissionDown {
        spec: ManagedSpec<kinds::PipelinePermissionParams>,
        project: String,
        resource_id: String,
        pipelines: Vec<String>,
    },
}

pub struct Converter {
    resolver: Resolver,
}

fn decode<P: DeserializeOwned>(obj: &Object) -> Result<ManagedSpec<P>, ConversionError> {
    obj.spec_as::<ManagedSpec<P>>().map_err(|e| ConversionError::Malformed(format!("{} spec: {}", obj.key(), e)))
}

fn encode<P: Serialize>(spec: &ManagedSpec<P>) -> Result<serde_json::Value, ConversionError> {
    serde_json::to_value(spec).map_err(|e| ConversionError::Malformed(e.to_string()))
}

fn unresolved(field: &str) -> impl FnOnce(ReferenceError) -> ConversionError + '_ {
    move |source| ConversionError::Unresolved { field: field.to_string(), source }
}

/// Drop the namespace when it is the object's own.
fn local(r: Reference, ns: Option<&str>) -> Reference {
    if r.namespace.as_deref() == ns {
        Reference { name: r.name, namespace: None }
    } else {
        r
    }
}

fn known_version(v: &str) -> Result<(), ConversionError> {
    if v == STORAGE_VERSION || v == LEGACY_VERSION {
        Ok(())
    } else {
        Err(ConversionError::UnknownVersion(v.to_string()))
    }
}

impl Converter {
    pub fn new(store: Arc<dyn Store>) -> Self { Self { resolver: Resolver::new(store) } }

    /// Convert `obj` to `desired_api_version`, or fail without output.
    pub async fn convert(&self, obj: &Object, desired_api_version: &str) -> Result<Object, ConversionError> {
        let res = self.convert_inner(obj, desired_api_version).await;
        let result = if res.is_ok() { "success" } else { "failure" };
        counter!("conversion_total", 1u64, "result" => result);
        res
    }

    async fn convert_inner(&self, obj: &Object, desired_api_version: &str) -> Result<Object, ConversionError> {
        let from = obj.version().to_string();
        let to = version_of(desired_api_version);
        known_version(&from)?;
        known_version(to)?;
        let plan = if from == to { Plan::Relabel } else { self.resolve(obj, to).await? };
        debug!(key = %obj.key(), %from, %to, "conversion planned");
        materialize(obj, to, plan)
    }

    /// Phase one: all lookups needed to convert `obj` to version `to`.
    pub async fn resolve(&self, obj: &Object, to: &str) -> Result<Plan, ConversionError> {
        if to == STORAGE_VERSION {
            self.plan_up(obj).await
        } else {
            self.plan_down(obj).await
        }
    }

    /// Reverse lookup: the record of `kind` whose external value equals `literal`.
    async fn find(&self, field: &str, kind: Kind, ns: Option<&str>, want: Want, literal: &str) -> Result<Reference, ConversionError> {
        let r = self.resolver.find_by_value(kind, ns, want.extract(), literal).await.map_err(unresolved(field))?;
        Ok(local(r, ns))
    }

    async fn plan_up(&self, obj: &Object) -> Result<Plan, ConversionError> {
        let ns = obj.metadata.namespace.as_deref();
        Ok(match obj.kind {
            Kind::GitRepository => {
                let spec = decode::<v1alpha1::GitRepositoryParams>(obj)?;
                let project = self.find("project", Kind::TeamProject, ns, Want::Name, &spec.params.project).await?;
                Plan::RepositoryUp { spec, project }
            }
            Kind::Pipeline => {
                let spec = decode::<v1alpha1::PipelineParams>(obj)?;
                let project = self.find("project", Kind::TeamProject, ns, Want::Name, &spec.params.project).await?;
                let repository = self.find_repository(ns, &spec.params.repository.name, &project).await?;
                Plan::PipelineUp { spec, project, repository }
            }
            Kind::PipelinePermission => {
                let spec = decode::<v1alpha1::PipelinePermissionParams>(obj)?;
                let project = self.find("project", Kind::TeamProject, ns, Want::Name, &spec.params.project).await?;
                let kind = ReferencableKind::from_str(&spec.params.resource.type_)
                    .map_err(|e| ConversionError::UnknownKind(e.to_string()))?;
                let target = self.find("resource", kind.kind(), ns, Want::Id, &spec.params.resource.id).await?;
                let mut pipelines = Vec::with_capacity(spec.params.pipelines.len());
                for (i, id) in spec.params.pipelines.iter().enumerate() {
                    pipelines.push(self.find(&format!("pipelines[{}]", i), Kind::Pipeline, ns, Want::Id, id).await?);
                }
                Plan::PermissionUp { spec, project, resource: (kind, target), pipelines }
            }
            Kind::TeamProject | Kind::PullRequest | Kind::Policy | Kind::Feed | Kind::ConnectorConfig => Plan::Relabel,
        })
    }

    /// Repository names are only unique within a project: when several
    /// records carry `name`, keep the ones that belong to `project`.
    async fn find_repository(&self, ns: Option<&str>, name: &str, project: &Reference) -> Result<Reference, ConversionError> {
        let kind = Kind::GitRepository;
        let field = "repository";
        let objs = self.resolver.store().list(kind, ns, None).await?;
        let mut hits: Vec<&Object> = objs.iter().filter(|o| extract::external_name(o).as_deref() == Some(name)).collect();
        if hits.len() > 1 {
            let owner = self.resolver.fetch(Kind::TeamProject, project, ns).await.map_err(unresolved("project"))?;
            hits.retain(|o| in_project(o, &owner, project, ns));
        }
        match hits.len() {
            0 => Err(unresolved(field)(ReferenceError::NotFound { kind, name: name.to_string() })),
            1 => {
                let o = hits.remove(0);
                Ok(local(Reference { name: o.metadata.name.clone(), namespace: o.metadata.namespace.clone() }, ns))
            }
            n => Err(unresolved(field)(ReferenceError::Ambiguous { kind, selector: format!("value={}", name), matches: n })),
        }
    }

    /// Forward lookup of the literal the legacy schema expects for `link`.
    async fn literal(&self, field: &str, link: &Link, kind: Kind, ns: Option<&str>, want: Want) -> Result<String, ConversionError> {
        if link.reference.is_some() || link.selector.is_some() {
            let req = ResolutionRequest { current_value: None, ..ResolutionRequest::for_link(link, kind, ns, want.extract()) };
            return Ok(self.resolver.resolve(&req).await.map_err(unresolved(field))?.resolved_value);
        }
        let Some(id) = link.value.as_deref().filter(|v| !v.is_empty()) else {
            return Err(ConversionError::Malformed(format!("{} has neither value nor reference", field)));
        };
        match want {
            Want::Id => Ok(id.to_string()),
            // Literal ids only map to a name through the record that owns the id.
            Want::Name => {
                let r = self.resolver.find_by_value(kind, ns, extract::external_id, id).await.map_err(unresolved(field))?;
                let target = self.resolver.fetch(kind, &r, ns).await.map_err(unresolved(field))?;
                extract::external_name(&target).ok_or_else(|| ConversionError::Unresolved {
                    field: field.to_string(),
                    source: ReferenceError::NotReady { kind, name: r.name },
                })
            }
        }
    }

    async fn plan_down(&self, obj: &Object) -> Result<Plan, ConversionError> {
        let ns = obj.metadata.namespace.as_deref();
        Ok(match obj.kind {
            Kind::GitRepository => {
                let spec = decode::<kinds::GitRepositoryParams>(obj)?;
                let project = self.literal("project", &spec.params.project, Kind::TeamProject, ns, Want::Name).await?;
                Plan::RepositoryDown { spec, project }
            }
            Kind::Pipeline => {
                let spec = decode::<kinds::PipelineParams>(obj)?;
                let project = self.literal("project", &spec.params.project, Kind::TeamProject, ns, Want::Name).await?;
                let repository =
                    self.literal("repository", &spec.params.repository, Kind::GitRepository, ns, Want::Name).await?;
                Plan::PipelineDown { spec, project, repository }
            }
            Kind::PipelinePermission => {
                let spec = decode::<kinds::PipelinePermissionParams>(obj)?;
                let project = self.literal("project", &spec.params.project, Kind::TeamProject, ns, Want::Name).await?;
                let r = &spec.params.resource;
                let resource_id = self.literal("resource", &r.link, r.kind.kind(), ns, Want::Id).await?;
                let mut pipelines = Vec::with_capacity(spec.params.pipelines.len());
                for (i, link) in spec.params.pipelines.iter().enumerate() {
                    pipelines.push(self.literal(&format!("pipelines[{}]", i), link, Kind::Pipeline, ns, Want::Id).await?);
                }
                Plan::PermissionDown { spec, project, resource_id, pipelines }
            }
            Kind::TeamProject | Kind::PullRequest | Kind::Policy | Kind::Feed | Kind::ConnectorConfig => Plan::Relabel,
        })
    }
}

/// Whether `repo` points at `owner`, the project record named by `project`.
/// A bound reference wins over whatever the spec says.
fn in_project(repo: &Object, owner: &Object, project: &Reference, ns: Option<&str>) -> bool {
    let owner_id = extract::external_id(owner);
    let owner_name = extract::external_name(owner);
    if let (Some(b), Some(id)) = (repo.status.bound_references.get("project"), owner_id.as_deref()) {
        return b.value == id;
    }
    let project_ns = project.namespace.as_deref().or(ns);
    let spec = &repo.spec["project"];
    if let Some(r) = spec.get("ref") {
        let ref_ns = r.get("namespace").and_then(|v| v.as_str()).or(repo.metadata.namespace.as_deref());
        return r.get("name").and_then(|v| v.as_str()) == Some(project.name.as_str()) && ref_ns == project_ns;
    }
    match spec {
        serde_json::Value::String(legacy) => owner_name.as_deref() == Some(legacy.as_str()),
        v => v.get("value").and_then(|v| v.as_str()).is_some_and(|id| owner_id.as_deref() == Some(id)),
    }
}

fn reference_link(r: Reference) -> Link { Link { reference: Some(r), ..Link::default() } }

/// Phase two: build the converted object. Pure.
pub fn materialize(obj: &Object, to: &str, plan: Plan) -> Result<Object, ConversionError> {
    let mut out = obj.clone();
    out.api_version = api_version(to);
    out.spec = match plan {
        Plan::Relabel => return Ok(out),
        Plan::RepositoryUp { spec, project } => encode(&ManagedSpec {
            connector_config_ref: spec.connector_config_ref,
            management_policy: spec.management_policy,
            params: kinds::GitRepositoryParams {
                project: reference_link(project),
                name: spec.params.name,
                default_branch: spec.params.default_branch,
            },
        })?,
        Plan::PipelineUp { spec, project, repository } => encode(&ManagedSpec {
            connector_config_ref: spec.connector_config_ref,
            management_policy: spec.management_policy,
            params: kinds::PipelineParams {
                project: reference_link(project),
                repository: reference_link(repository),
                name: spec.params.name,
                folder: spec.params.folder,
                yaml_path: spec.params.yaml_path,
            },
        })?,
        Plan::PermissionUp { spec, project, resource: (kind, target), pipelines } => encode(&ManagedSpec {
            connector_config_ref: spec.connector_config_ref,
            management_policy: spec.management_policy,
            params: kinds::PipelinePermissionParams {
                project: reference_link(project),
                resource: TypedLink { kind, link: reference_link(target) },
                pipelines: pipelines.into_iter().map(reference_link).collect(),
                authorize_all: spec.params.authorize_all,
            },
        })?,
        Plan::RepositoryDown { spec, project } => encode(&ManagedSpec {
            connector_config_ref: spec.connector_config_ref,
            management_policy: spec.management_policy,
            params: v1alpha1::GitRepositoryParams { project, name: spec.params.name, default_branch: spec.params.default_branch },
        })?,
        Plan::PipelineDown { spec, project, repository } => encode(&ManagedSpec {
            connector_config_ref: spec.connector_config_ref,
            management_policy: spec.management_policy,
            params: v1alpha1::PipelineParams {
                project,
                repository: v1alpha1::RepositoryName { name: repository },
                name: spec.params.name,
                folder: spec.params.folder,
                yaml_path: spec.params.yaml_path,
            },
        })?,
        Plan::PermissionDown { spec, project, resource_id, pipelines } => encode(&ManagedSpec {
            connector_config_ref: spec.connector_config_ref,
            management_policy: spec.management_policy,
            params: v1alpha1::PipelinePermissionParams {
                project,
                resource: v1alpha1::PermissionResource {
                    type_: spec.params.resource.kind.resource_type().to_string(),
                    id: resource_id,
                },
                pipelines,
                authorize_all: spec.params.authorize_all,
            },
        })?,
    };
    Ok(out)
}
