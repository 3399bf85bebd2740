pub(crate) mod com;
pub(crate) mod d3d11;
pub(crate) mod gpu;
pub(crate) mod vrr;
pub(crate) mod wgc;
