#![cfg_attr(not(test), no_std)]

use core::fmt::{self, Write};
use corvid_sync::Spin;

/// A sink for kernel console output, registered by the platform layer.
pub trait ConsoleWrite: Send + Sync {
    fn write(&self, s: &str);
}

struct Console {
    console: Option<&'static dyn ConsoleWrite>,
}

static CONSOLE: Spin<Console> = Spin::new(Console { console: None });

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(console) = self.console {
            console.write(s);
        }
        Ok(())
    }
}

/// Output written before a console is registered is dropped.
pub fn set_console(console: &'static dyn ConsoleWrite) {
    CONSOLE.lock().console.replace(console);
}

#[doc(hidden)]
pub fn do_print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::do_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_warn {
    ($($arg:tt)*) => {
        $crate::println!("[kernel: warn] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_debug {
    ($($arg:tt)*) => {
        $crate::println!("[kernel:debug] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_info {
    ($($arg:tt)*) => {
        $crate::println!("[kernel: info] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_fatal {
    ($($arg:tt)*) => {
        $crate::println!("[kernel:fatal] {}", format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_sync::Spin;

    struct Recorder {
        lines: Spin<Vec<String>>,
    }

    impl ConsoleWrite for Recorder {
        fn write(&self, s: &str) {
            self.lines.lock().push(s.to_owned());
        }
    }

    #[test]
    fn prints_through_registered_console() {
        let recorder: &'static Recorder = Box::leak(Box::new(Recorder {
            lines: Spin::new(Vec::new()),
        }));
        set_console(recorder);

        println_info!("hello {}", 42);

        let joined = recorder.lines.lock().concat();
        assert!(joined.contains("[kernel: info] hello 42"));
    }
}
