//! Mapping from agent types to the assets that draw them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::agent::TypeId;

/// Mesh name used when a type has no usable geometry.
pub const DEFAULT_MESH_NAME: &str = "SPHERE";

/// Display name for types the data source never named.
pub fn unassigned_name(type_id: TypeId) -> String {
    format!("Unassigned-{}", type_id)
}

fn default_scale() -> f32 {
    1.0
}

/// Geometry and appearance bound to one type id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeGeometryBinding {
    #[serde(default)]
    pub name: Option<String>,
    /// Mesh asset name, resolved through the asset provider.
    #[serde(default)]
    pub mesh: Option<String>,
    /// Atomic structure asset name.
    #[serde(default)]
    pub pdb: Option<String>,
    #[serde(default = "default_scale")]
    pub scale: f32,
    /// Optional `#RRGGBB` override for the type's color.
    #[serde(default)]
    pub color: Option<String>,
}

impl Default for TypeGeometryBinding {
    fn default() -> Self {
        Self {
            name: None,
            mesh: None,
            pdb: None,
            scale: 1.0,
            color: None,
        }
    }
}

impl TypeGeometryBinding {
    pub fn mesh(name: &str) -> Self {
        Self {
            mesh: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn pdb(name: &str) -> Self {
        Self {
            pdb: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Every asset name this binding refers to.
    pub fn asset_names(&self) -> impl Iterator<Item = &str> {
        self.mesh.iter().chain(self.pdb.iter()).map(|s| s.as_str())
    }
}

/// All type bindings for one trajectory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeMap {
    bindings: HashMap<TypeId, TypeGeometryBinding>,
}

impl TypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, type_id: TypeId) -> Option<&TypeGeometryBinding> {
        self.bindings.get(&type_id)
    }

    /// Insert or replace a binding, returning whether it changed.
    pub fn insert(&mut self, type_id: TypeId, binding: TypeGeometryBinding) -> bool {
        match self.bindings.get(&type_id) {
            Some(existing) if *existing == binding => false,
            _ => {
                self.bindings.insert(type_id, binding);
                true
            }
        }
    }

    /// Merge `other` into this map, returning the type ids whose binding changed.
    pub fn merge(&mut self, other: TypeMap) -> Vec<TypeId> {
        let mut changed: Vec<TypeId> = other
            .bindings
            .into_iter()
            .filter_map(|(id, b)| self.insert(id, b).then_some(id))
            .collect();
        changed.sort_unstable();
        changed
    }

    /// Display name of a type.
    pub fn display_name(&self, type_id: TypeId) -> String {
        self.get(type_id)
            .and_then(|b| b.name.clone())
            .unwrap_or_else(|| unassigned_name(type_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TypeId, &TypeGeometryBinding)> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_type_map() {
        let json = r#"{
            "0": { "name": "actin", "mesh": "actin.obj", "scale": 2.0 },
            "3": { "pdb": "1abc.pdb" }
        }"#;
        let map: TypeMap = serde_json::from_str(json).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(0).unwrap().mesh.as_deref(), Some("actin.obj"));
        assert_eq!(map.get(3).unwrap().scale, 1.0);
        assert_eq!(map.display_name(0), "actin");
        assert_eq!(map.display_name(3), "Unassigned-3");
    }

    #[test]
    fn test_merge_reports_changes() {
        let mut map = TypeMap::new();
        map.insert(1, TypeGeometryBinding::mesh("a.obj"));

        let mut late = TypeMap::new();
        late.insert(1, TypeGeometryBinding::mesh("a.obj"));
        late.insert(2, TypeGeometryBinding::pdb("b.pdb"));
        assert_eq!(map.merge(late), vec![2]);

        let mut rebind = TypeMap::new();
        rebind.insert(1, TypeGeometryBinding::mesh("c.obj").with_scale(3.0));
        assert_eq!(map.merge(rebind), vec![1]);
        assert_eq!(map.get(1).unwrap().scale, 3.0);
    }

    #[test]
    fn test_asset_names() {
        let binding = TypeGeometryBinding {
            mesh: Some("m.obj".into()),
            pdb: Some("p.pdb".into()),
            ..Default::default()
        };
        let names: Vec<&str> = binding.asset_names().collect();
        assert_eq!(names, vec!["m.obj", "p.pdb"]);
    }
}
