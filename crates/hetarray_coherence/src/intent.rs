//! How a kernel invocation uses an array argument.

use serde::{Deserialize, Serialize};

/// Access intent of one kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AccessIntent {
    /// Argument not used.
    #[default]
    None,
    /// Read, never written.
    ReadOnly,
    /// Fully overwritten without being read.
    WriteOnly,
    /// Read and written.
    ReadWrite,
}

impl AccessIntent {
    /// Whether the current contents must be present before the kernel runs.
    pub fn reads(&self) -> bool {
        matches!(self, AccessIntent::ReadOnly | AccessIntent::ReadWrite)
    }

    /// Whether the kernel leaves new contents behind.
    pub fn writes(&self) -> bool {
        matches!(self, AccessIntent::WriteOnly | AccessIntent::ReadWrite)
    }

    /// Combined intent of an array passed as several arguments.
    pub fn merge(self, other: AccessIntent) -> AccessIntent {
        match (self.reads() || other.reads(), self.writes() || other.writes()) {
            (true, true) => AccessIntent::ReadWrite,
            (true, false) => AccessIntent::ReadOnly,
            (false, true) => AccessIntent::WriteOnly,
            (false, false) => AccessIntent::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge() {
        use AccessIntent::*;
        assert_eq!(None.merge(ReadOnly), ReadOnly);
        assert_eq!(ReadOnly.merge(WriteOnly), ReadWrite);
        assert_eq!(WriteOnly.merge(WriteOnly), WriteOnly);
        assert_eq!(ReadWrite.merge(None), ReadWrite);
        assert_eq!(None.merge(None), None);
    }

    #[test]
    fn test_reads_writes() {
        assert!(AccessIntent::ReadWrite.reads());
        assert!(AccessIntent::ReadWrite.writes());
        assert!(!AccessIntent::WriteOnly.reads());
        assert!(!AccessIntent::None.writes());
    }
}
