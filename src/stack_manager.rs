use crate::error::{ReconError, Result};
use crate::stack::Stack;

/// Named collection of stacks with unique names, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct StackManager {
    stacks: Vec<Stack>,
}

impl StackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect stacks, rejecting duplicate names.
    pub fn from_stacks(stacks: impl IntoIterator<Item = Stack>) -> Result<Self> {
        let mut manager = Self::new();
        for stack in stacks {
            manager.add(stack)?;
        }
        Ok(manager)
    }

    pub fn add(&mut self, stack: Stack) -> Result<()> {
        if self.get(stack.name()).is_some() {
            return Err(ReconError::DuplicateStack(stack.name().to_string()));
        }
        self.stacks.push(stack);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Stack> {
        self.stacks.iter().find(|stack| stack.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Stack> {
        self.stacks.iter_mut().find(|stack| stack.name() == name)
    }

    pub fn get_index(&self, index: usize) -> Option<&Stack> {
        self.stacks.get(index)
    }

    pub fn get_index_mut(&mut self, index: usize) -> Option<&mut Stack> {
        self.stacks.get_mut(index)
    }

    /// Look up a stack by name, failing if it is absent.
    pub fn require(&self, name: &str) -> Result<&Stack> {
        self.get(name)
            .ok_or_else(|| ReconError::StackNotFound(name.to_string()))
    }

    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stack> {
        self.stacks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stack> {
        self.stacks.iter_mut()
    }

    /// Every stack except the one at `index`.
    pub fn without(&self, index: usize) -> Vec<&Stack> {
        self.stacks
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, stack)| stack)
            .collect()
    }

    pub fn into_stacks(self) -> Vec<Stack> {
        self.stacks
    }

    /// Total number of slices over all stacks.
    pub fn slice_count(&self) -> usize {
        self.stacks.iter().map(Stack::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use nalgebra::Vector3;
    use ndarray::Array3;

    fn stack(name: &str) -> Stack {
        let geometry = Geometry::axis_aligned((3, 2, 2), Vector3::repeat(1.0)).unwrap();
        Stack::from_volume(name, Array3::zeros((3, 2, 2)), None, geometry).unwrap()
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = StackManager::from_stacks([stack("a"), stack("b"), stack("a")]).unwrap_err();
        assert!(matches!(err, ReconError::DuplicateStack(name) if name == "a"));
    }

    #[test]
    fn lookup_and_exclusion() {
        let manager = StackManager::from_stacks([stack("a"), stack("b"), stack("c")]).unwrap();
        assert_eq!(manager.len(), 3);
        assert_eq!(manager.slice_count(), 9);
        assert_eq!(manager.get_index(1).map(Stack::name), Some("b"));
        assert!(manager.require("d").is_err());
        let others: Vec<&str> = manager.without(1).into_iter().map(Stack::name).collect();
        assert_eq!(others, vec!["a", "c"]);
    }
}
