// Primitive number types a receive buffer can be made of.
pub trait Align1: bytemuck::Pod {}

impl Align1 for u8 {}
impl Align1 for u32 {}
impl Align1 for i32 {}
impl Align1 for u64 {}
impl Align1 for f32 {}
impl Align1 for f64 {}

// Receive buffers whose items are at least 4 bytes aligned, so `f32` payloads can be
// borrowed straight out of them.
pub trait Align4: Align1 {}

impl Align4 for u32 {}
impl Align4 for i32 {}
impl Align4 for u64 {}
impl Align4 for f32 {}
impl Align4 for f64 {}
