//! The network: a table of components addressed by handle.

use crate::component::Component;
use crate::computation::ComponentId;
use crate::{Error, Result};

/// Component table referenced by `Propagate`/`Backprop` commands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Network {
    components: Vec<Component>,
}

impl Network {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component and return its handle.
    pub fn add_component(&mut self, component: Component) -> ComponentId {
        let id = ComponentId(self.components.len());
        self.components.push(component);
        id
    }

    /// Get a component by handle.
    pub fn component(&self, id: ComponentId) -> Result<&Component> {
        self.components
            .get(id.index())
            .ok_or(Error::ComponentNotFound(id.index()))
    }

    /// Number of components.
    pub fn num_components(&self) -> usize {
        self.components.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_lookup() {
        let mut network = Network::new();
        let id = network.add_component(Component::Tanh);
        assert_eq!(network.component(id).unwrap(), &Component::Tanh);
        assert!(network.component(ComponentId(1)).is_err());
    }
}
