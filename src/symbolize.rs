use std::sync::Arc;

use crate::error::SymbolizeError;
use crate::event::Frame;
use crate::runtime::{FrameObject, TracebackObject};

/// Converts raw frame and traceback objects into the symbolic frames
/// carried by sample events.
///
/// Both methods return the frames (innermost first, truncated to
/// `max_nframes`) together with the total stack depth before truncation.
pub trait Symbolizer: Send + Sync {
    fn framify(
        &self,
        frame: &FrameObject,
        max_nframes: usize,
    ) -> Result<(Vec<Frame>, usize), SymbolizeError>;

    fn traceback_framify(
        &self,
        traceback: &TracebackObject,
        max_nframes: usize,
    ) -> Result<(Vec<Frame>, usize), SymbolizeError>;
}

/// Symbolizer for runtimes whose frames form a simple caller chain.
///
/// Walks `back` links outward from the given frame; tracebacks are followed
/// to their innermost node first, since that node's frame chain is the full
/// stack at the raise point.
pub struct ChainSymbolizer;

impl ChainSymbolizer {
    fn symbolic(frame: &FrameObject) -> Frame {
        Frame {
            function: frame.function.to_string(),
            filename: frame.filename.to_string(),
            lineno: frame.lineno,
        }
    }
}

impl Symbolizer for ChainSymbolizer {
    fn framify(
        &self,
        frame: &FrameObject,
        max_nframes: usize,
    ) -> Result<(Vec<Frame>, usize), SymbolizeError> {
        let mut frames = Vec::new();
        let mut nframes = 1usize;
        if max_nframes > 0 {
            frames.push(Self::symbolic(frame));
        }

        let mut current: Option<Arc<FrameObject>> = frame.back.clone();
        while let Some(f) = current {
            nframes += 1;
            if frames.len() < max_nframes {
                frames.push(Self::symbolic(&f));
            }
            current = f.back.clone();
        }

        Ok((frames, nframes))
    }

    fn traceback_framify(
        &self,
        traceback: &TracebackObject,
        max_nframes: usize,
    ) -> Result<(Vec<Frame>, usize), SymbolizeError> {
        let mut innermost: Arc<TracebackObject> = match &traceback.next {
            Some(next) => Arc::clone(next),
            None => return self.framify(&traceback.frame, max_nframes),
        };
        loop {
            let next = match &innermost.next {
                Some(next) => Arc::clone(next),
                None => break,
            };
            innermost = next;
        }
        self.framify(&innermost.frame, max_nframes)
    }
}
