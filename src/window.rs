/// A top-level window, identified by its native `HWND` value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WindowId {
    handle: isize,
}

impl WindowId {
    pub const fn from_raw_handle(raw_handle: isize) -> Self {
        Self { handle: raw_handle }
    }

    pub const fn raw_handle(&self) -> isize {
        self.handle
    }

    pub const fn is_null(&self) -> bool {
        self.handle == 0
    }

    pub fn stable_id(&self) -> String {
        format!("{:016x}", self.handle as usize as u64)
    }
}

/// A display, identified by its native `HMONITOR` value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MonitorHandle {
    handle: isize,
}

impl MonitorHandle {
    pub const fn from_raw_handle(raw_handle: isize) -> Self {
        Self { handle: raw_handle }
    }

    pub const fn raw_handle(&self) -> isize {
        self.handle
    }

    pub const fn is_null(&self) -> bool {
        self.handle == 0
    }

    pub fn stable_id(&self) -> String {
        format!("monitor:{:016x}", self.handle as usize as u64)
    }
}
