//! Minimal notebook document model.
//!
//! The host owns the real document; this is the view the kernel layer needs:
//! a stable document URI and an ordered list of cells, each identified by its
//! own cell-document URI. Execute requests carry that cell URI in their
//! metadata (`cellId`), which is how outgoing messages are tied back to cells.

use std::sync::{PoisonError, RwLock};

use uuid::Uuid;

/// A cell as seen by the kernel layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotebookCell {
    /// Position of the cell in its notebook.
    pub index: usize,
    /// URI of the cell's own text document (unique per cell).
    pub document_uri: String,
    pub source: String,
}

/// A notebook document with interior mutability so it can be shared between
/// the kernel, the tracker and the host as `Arc<NotebookDocument>`.
#[derive(Debug)]
pub struct NotebookDocument {
    uri: String,
    cells: RwLock<Vec<NotebookCell>>,
}

impl NotebookDocument {
    /// Create an empty notebook.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            cells: RwLock::new(Vec::new()),
        }
    }

    /// Create a notebook with one cell per source string.
    pub fn with_cells<I, S>(uri: impl Into<String>, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let doc = Self::new(uri);
        for source in sources {
            doc.push_cell(source);
        }
        doc
    }

    /// The document URI. Stable for the lifetime of the document and across
    /// restarts of the front-end.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn cell_count(&self) -> usize {
        self.read().len()
    }

    pub fn cell_at(&self, index: usize) -> Option<NotebookCell> {
        self.read().get(index).cloned()
    }

    pub fn cells(&self) -> Vec<NotebookCell> {
        self.read().clone()
    }

    /// Find the cell whose own document URI is `document_uri`.
    pub fn find_cell(&self, document_uri: &str) -> Option<NotebookCell> {
        self.read()
            .iter()
            .find(|cell| cell.document_uri == document_uri)
            .cloned()
    }

    /// Append a cell and return it.
    pub fn push_cell(&self, source: impl Into<String>) -> NotebookCell {
        let mut cells = self.write();
        let cell = NotebookCell {
            index: cells.len(),
            document_uri: self.new_cell_uri(),
            source: source.into(),
        };
        cells.push(cell.clone());
        cell
    }

    /// Insert a cell at `index` (clamped to the end) and re-index the cells
    /// after it.
    pub fn insert_cell(&self, index: usize, source: impl Into<String>) -> NotebookCell {
        let mut cells = self.write();
        let index = index.min(cells.len());
        cells.insert(
            index,
            NotebookCell {
                index,
                document_uri: self.new_cell_uri(),
                source: source.into(),
            },
        );
        reindex(&mut cells);
        cells[index].clone()
    }

    /// Remove the cell at `index`, re-indexing the cells after it.
    pub fn remove_cell(&self, index: usize) -> Option<NotebookCell> {
        let mut cells = self.write();
        if index >= cells.len() {
            return None;
        }
        let removed = cells.remove(index);
        reindex(&mut cells);
        Some(removed)
    }

    fn new_cell_uri(&self) -> String {
        format!("{}#cell-{}", self.uri, Uuid::new_v4())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<NotebookCell>> {
        self.cells.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<NotebookCell>> {
        self.cells.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn reindex(cells: &mut [NotebookCell]) {
    for (i, cell) in cells.iter_mut().enumerate() {
        cell.index = i;
    }
}
