use ahash::AHashMap;

pub type RouteId = u32;

/// A registered route. Immutable once interned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub id: String,
    pub label: String,
    pub color: String,
}

/// Interns route identities to dense `RouteId`s so edges carry `u32`s
/// instead of cloned strings.
#[derive(Debug, Default)]
pub struct RouteRegistry {
    to_id: AHashMap<String, RouteId>,
    routes: Vec<Route>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert(&mut self, id: &str, label: &str, color: &str) -> RouteId {
        if let Some(&rid) = self.to_id.get(id) {
            return rid;
        }
        let rid = self.routes.len() as RouteId;
        self.routes.push(Route {
            id: id.to_string(),
            label: label.to_string(),
            color: color.to_string(),
        });
        self.to_id.insert(id.to_string(), rid);
        rid
    }

    pub fn get(&self, rid: RouteId) -> Option<&Route> {
        self.routes.get(rid as usize)
    }

    pub fn get_by_id(&self, id: &str) -> Option<RouteId> {
        self.to_id.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RouteId, &Route)> {
        self.routes
            .iter()
            .enumerate()
            .map(|(i, r)| (i as RouteId, r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let mut reg = RouteRegistry::new();
        let a = reg.get_or_insert("U1", "U1", "ff0000");
        let b = reg.get_or_insert("U2", "U2", "00ff00");
        assert_ne!(a, b);
        assert_eq!(reg.get_or_insert("U1", "ignored", "ignored"), a);
        assert_eq!(reg.get(a).unwrap().color, "ff0000");
        assert_eq!(reg.get_by_id("U2"), Some(b));
        assert_eq!(reg.len(), 2);
    }
}
