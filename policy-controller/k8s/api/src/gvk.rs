use kube::core::ApiResource;
use std::fmt;

/// The (group, version, kind) triple used as the primary key across watch,
/// sync, and constraint tracking. Equality is structural.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: impl ToString, version: impl ToString, kind: impl ToString) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// The `apiVersion` string for this kind, e.g. `apps/v1` or `v1` for
    /// the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// The group-version pair, without the kind.
    pub fn group_version(&self) -> (String, String) {
        (self.group.clone(), self.version.clone())
    }

    /// An `ApiResource` suitable for dynamic-object API access. The plural
    /// name is inferred, which is sufficient for CRDs following standard
    /// pluralization.
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&kube::core::GroupVersionKind::gvk(
            &self.group,
            &self.version,
            &self.kind,
        ))
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}, Kind={}", self.group, self.version, self.kind)
    }
}

impl From<&kube::core::GroupVersionKind> for GroupVersionKind {
    fn from(gvk: &kube::core::GroupVersionKind) -> Self {
        Self::new(&gvk.group, &gvk.version, &gvk.kind)
    }
}
