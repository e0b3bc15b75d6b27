use crate::StorageError;
use quadflow_model::Quad;

/// A push-based sink for a stream of quads.
///
/// Producers call [`start`](QuadHandler::start) once, [`handle`](QuadHandler::handle) for every
/// quad of the stream, and [`finish`](QuadHandler::finish) once at the end. Handlers are
/// frequently chained, each stage forwarding (possibly transformed) quads to the next.
pub trait QuadHandler: Send {
    /// Signals the beginning of the stream.
    fn start(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Processes one quad of the stream.
    fn handle(&mut self, quad: Quad) -> Result<(), StorageError>;

    /// Signals the end of the stream.
    ///
    /// Stages that buffer or defer work perform it here, before propagating the signal
    /// downstream.
    fn finish(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

impl<H: QuadHandler + ?Sized> QuadHandler for &mut H {
    fn start(&mut self) -> Result<(), StorageError> {
        (**self).start()
    }

    fn handle(&mut self, quad: Quad) -> Result<(), StorageError> {
        (**self).handle(quad)
    }

    fn finish(&mut self) -> Result<(), StorageError> {
        (**self).finish()
    }
}

impl<H: QuadHandler + ?Sized> QuadHandler for Box<H> {
    fn start(&mut self) -> Result<(), StorageError> {
        (**self).start()
    }

    fn handle(&mut self, quad: Quad) -> Result<(), StorageError> {
        (**self).handle(quad)
    }

    fn finish(&mut self) -> Result<(), StorageError> {
        (**self).finish()
    }
}

/// A [`QuadHandler`] that collects the stream into a vector, preserving order.
#[derive(Debug, Default)]
pub struct CollectingHandler {
    quads: Vec<Quad>,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quads(&self) -> &[Quad] {
        &self.quads
    }

    pub fn into_quads(self) -> Vec<Quad> {
        self.quads
    }
}

impl QuadHandler for CollectingHandler {
    fn handle(&mut self, quad: Quad) -> Result<(), StorageError> {
        self.quads.push(quad);
        Ok(())
    }
}
