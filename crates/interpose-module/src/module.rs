//! The module contract and the per-pair chain.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::error::ModuleError;

/// Which way a unit is flowing through a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    AToB,
    BToA,
}

impl Direction {
    pub fn is_a_to_b(self) -> bool {
        self == Direction::AToB
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::AToB => Direction::BToA,
            Direction::BToA => Direction::AToB,
        }
    }

    /// `>` for A→B, `<` for B→A.
    pub fn marker(self) -> char {
        match self {
            Direction::AToB => '>',
            Direction::BToA => '<',
        }
    }

    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::AToB => "a_to_b",
            Direction::BToA => "b_to_a",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The endpoint pair a module instance is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairInfo {
    pub id: u64,
    pub a: String,
    pub b: String,
}

impl PairInfo {
    pub fn new(id: u64, a: impl Into<String>, b: impl Into<String>) -> Self {
        Self {
            id,
            a: a.into(),
            b: b.into(),
        }
    }
}

/// A transform applied to every unit flowing through one pair.
pub trait Module: Send {
    /// `None` drops the unit.
    fn handle(&mut self, data: Bytes, direction: Direction) -> Option<Bytes>;

    /// Called once when the pair finishes.
    fn close(&mut self) {}
}

/// Produces one [`Module`] per pair. Created once from configuration.
pub trait ModuleFactory: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn create(&self, pair: &PairInfo) -> Result<Box<dyn Module>, ModuleError>;
}

/// The modules bound to one pair, in registration order.
#[derive(Default)]
pub struct ModuleChain {
    modules: Vec<Box<dyn Module>>,
    closed: bool,
}

impl fmt::Debug for ModuleChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleChain")
            .field("modules", &self.modules.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl ModuleChain {
    pub fn new(modules: Vec<Box<dyn Module>>) -> Self {
        Self {
            modules,
            closed: false,
        }
    }

    pub fn push(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Run every module in order. The first drop stops the chain.
    pub fn apply(&mut self, data: Bytes, direction: Direction) -> Option<Bytes> {
        let mut data = data;
        for (i, module) in self.modules.iter_mut().enumerate() {
            match module.handle(data, direction) {
                Some(next) => data = next,
                None => {
                    trace!(module = i, %direction, "unit dropped");
                    return None;
                }
            }
        }
        Some(data)
    }

    /// Close every module once.
    pub fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        for module in &mut self.modules {
            module.close();
        }
    }
}

/// The configured factories, in order.
#[derive(Debug, Clone, Default)]
pub struct ChainFactory {
    factories: Vec<Arc<dyn ModuleFactory>>,
}

impl ChainFactory {
    pub fn new(factories: Vec<Arc<dyn ModuleFactory>>) -> Self {
        Self { factories }
    }

    pub fn push(&mut self, factory: Arc<dyn ModuleFactory>) {
        self.factories.push(factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// A fresh chain for one pair.
    pub fn build(&self, pair: &PairInfo) -> Result<ModuleChain, ModuleError> {
        let modules = self
            .factories
            .iter()
            .map(|f| f.create(pair))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ModuleChain::new(modules))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Appends a tag to every unit and records what it saw.
    pub struct Tag {
        pub tag: &'static [u8],
        pub seen: Arc<Mutex<Vec<(Direction, Bytes)>>>,
    }

    impl Module for Tag {
        fn handle(&mut self, data: Bytes, direction: Direction) -> Option<Bytes> {
            self.seen.lock().push((direction, data.clone()));
            let mut out = data.to_vec();
            out.extend_from_slice(self.tag);
            Some(Bytes::from(out))
        }
    }

    struct DropAll;

    impl Module for DropAll {
        fn handle(&mut self, _data: Bytes, _direction: Direction) -> Option<Bytes> {
            None
        }
    }

    struct CountClose(Arc<Mutex<u32>>);

    impl Module for CountClose {
        fn handle(&mut self, data: Bytes, _direction: Direction) -> Option<Bytes> {
            Some(data)
        }

        fn close(&mut self) {
            *self.0.lock() += 1;
        }
    }

    #[test]
    fn test_chain_applies_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut chain = ModuleChain::new(vec![
            Box::new(Tag { tag: b"1", seen: seen.clone() }),
            Box::new(Tag { tag: b"2", seen: seen.clone() }),
        ]);
        let out = chain.apply(Bytes::from_static(b"x"), Direction::AToB).unwrap();
        assert_eq!(&out[..], b"x12");
        assert_eq!(seen.lock()[1].1, Bytes::from_static(b"x1"));
    }

    #[test]
    fn test_drop_stops_the_chain() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut chain = ModuleChain::new(vec![
            Box::new(DropAll),
            Box::new(Tag { tag: b"!", seen: seen.clone() }),
        ]);
        assert!(chain.apply(Bytes::from_static(b"x"), Direction::BToA).is_none());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let mut chain = ModuleChain::default();
        let out = chain.apply(Bytes::from_static(b"same"), Direction::AToB);
        assert_eq!(out, Some(Bytes::from_static(b"same")));
    }

    #[test]
    fn test_close_runs_once() {
        let count = Arc::new(Mutex::new(0));
        let mut chain = ModuleChain::new(vec![Box::new(CountClose(count.clone()))]);
        chain.close();
        chain.close();
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_direction_markers() {
        assert_eq!(Direction::AToB.marker(), '>');
        assert_eq!(Direction::BToA.marker(), '<');
        assert_eq!(Direction::AToB.reverse(), Direction::BToA);
    }
}
