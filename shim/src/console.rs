use skiff_core::guest::WindowSize;

const DEFAULT_COLS: u32 = 80;
const DEFAULT_ROWS: u32 = 24;

/// Host view of a terminal process's pty. The pty itself lives in the guest;
/// the console tracks its size so it can be replayed when the process
/// starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Console {
    cols: u32,
    rows: u32,
}

impl Default for Console {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl Console {
    pub fn for_process(process: &oci_spec::runtime::Process) -> Self {
        match process.console_size() {
            Some(size) if size.width() > 0 && size.height() > 0 => Self {
                cols: size.width() as u32,
                rows: size.height() as u32,
            },
            _ => Self::default(),
        }
    }

    pub fn resize(&mut self, cols: u32, rows: u32) {
        self.cols = cols;
        self.rows = rows;
    }

    pub fn window_size(&self) -> WindowSize {
        WindowSize {
            cols: self.cols,
            rows: self.rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::{BoxBuilder, Process};

    #[test]
    fn test_size_from_process() {
        let mut process = Process::default();
        assert_eq!(Console::for_process(&process), Console::default());

        process.set_console_size(Some(
            BoxBuilder::default().width(120u64).height(40u64).build().unwrap(),
        ));
        let mut console = Console::for_process(&process);
        assert_eq!(console.window_size(), WindowSize { cols: 120, rows: 40 });

        console.resize(100, 30);
        assert_eq!(console.window_size(), WindowSize { cols: 100, rows: 30 });
    }
}
