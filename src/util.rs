use enumflags2::{BitFlags, RawBitFlags};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Locks `m`, recovering the guard if another thread panicked while holding it.
///
/// Mirror state stays usable after a panicking user callback: every mutation is a plain
/// field assignment, so a poisoned guard never exposes a half-applied update.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Formats a flag set as `A | B | C` using the variant `Debug` names.
pub struct BitFlagsDebug<T: RawBitFlags>(pub BitFlags<T>);

impl<T: RawBitFlags + fmt::Debug> fmt::Debug for BitFlagsDebug<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BitFlags(")?;
        write_joined(f, self.0.iter(), " | ", |f, v| write!(f, "{:?}", v))?;
        write!(f, ")")
    }
}

pub fn write_joined<I, F>(f: &mut fmt::Formatter, items: I, sep: &str, mut item: F) -> fmt::Result
    where I: IntoIterator,
          F: FnMut(&mut fmt::Formatter, I::Item) -> fmt::Result,
{
    let mut it = items.into_iter().peekable();
    while let Some(v) = it.next() {
        item(f, v)?;
        if it.peek().is_some() {
            f.write_str(sep)?;
        }
    }
    Ok(())
}
