use std::fmt;

const LAYER_SHIFT: u32 = 62;
const OFFSET_MASK: u64 = (1 << LAYER_SHIFT) - 1;

/// Logical sub-space of the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Layer {
    /// The scratch segment of the active write transaction.
    Scratch = 0,
    /// The committed, segmented log.
    Durable = 1,
}

impl Layer {
    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            0 => Some(Layer::Scratch),
            1 => Some(Layer::Durable),
            _ => None,
        }
    }
}

/// Stable 64-bit handle of a chunk: two layer bits above a 62-bit offset.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u64);

impl Address {
    pub const NIL: Address = Address(u64::MAX);

    pub fn new(layer: Layer, offset: u64) -> Self {
        debug_assert!(offset <= OFFSET_MASK, "offset {:#x} overflows 62 bits", offset);
        Address(((layer as u64) << LAYER_SHIFT) | (offset & OFFSET_MASK))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Address(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    /// `None` for `NIL` and for the reserved layers.
    pub fn layer(self) -> Option<Layer> {
        if self.is_nil() {
            return None;
        }
        Layer::from_bits(self.0 >> LAYER_SHIFT)
    }

    pub fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            return write!(f, "Address(nil)");
        }
        match self.layer() {
            Some(layer) => write!(f, "Address({:?}:{:#x})", layer, self.offset()),
            None => write!(f, "Address({:#018x})", self.0),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
