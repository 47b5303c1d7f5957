use crate::unwind_info::types::CompactUnwindRow;

/// A stage in the row post-processing pipeline. Stages forward the rows
/// they keep to the next one.
pub trait UnwindRowSink {
    fn push(&mut self, row: CompactUnwindRow);
    fn finish(&mut self) {}
}

#[derive(Default)]
pub struct VecSink(Vec<CompactUnwindRow>);

impl VecSink {
    pub fn into_vec(self) -> Vec<CompactUnwindRow> {
        self.0
    }
}

impl UnwindRowSink for VecSink {
    fn push(&mut self, row: CompactUnwindRow) {
        self.0.push(row);
    }
}

/// Collapses an end of function marker and a row that share their address,
/// keeping the later one. A marker followed by the next function's first row
/// is redundant, and a row that starts where its function ends covers no code.
pub struct RemoveUnnecessaryMarkers<S> {
    inner: S,
    pending: Option<CompactUnwindRow>,
}

impl<S: UnwindRowSink> RemoveUnnecessaryMarkers<S> {
    pub fn new(inner: S) -> Self {
        RemoveUnnecessaryMarkers {
            inner,
            pending: None,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: UnwindRowSink> UnwindRowSink for RemoveUnnecessaryMarkers<S> {
    fn push(&mut self, row: CompactUnwindRow) {
        let Some(prev) = self.pending.take() else {
            self.pending = Some(row);
            return;
        };

        if prev.pc != row.pc {
            self.inner.push(prev);
            self.pending = Some(row);
            return;
        }

        if !prev.is_end_of_function_marker() && !row.is_end_of_function_marker() {
            self.inner.push(prev);
        }
        self.pending = Some(row);
    }

    fn finish(&mut self) {
        if let Some(last) = self.pending.take() {
            self.inner.push(last);
        }
        self.inner.finish();
    }
}

/// Drops rows that describe the same unwinding steps as the previous row.
pub struct RemoveRedundant<S> {
    inner: S,
    last_kept: Option<CompactUnwindRow>,
}

impl<S: UnwindRowSink> RemoveRedundant<S> {
    pub fn new(inner: S) -> Self {
        RemoveRedundant {
            inner,
            last_kept: None,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: UnwindRowSink> UnwindRowSink for RemoveRedundant<S> {
    fn push(&mut self, row: CompactUnwindRow) {
        let redundant = self.last_kept.is_some_and(|prev| {
            row.cfa_type == prev.cfa_type
                && row.cfa_offset == prev.cfa_offset
                && row.fp_type == prev.fp_type
                && row.fp_offset == prev.fp_offset
                && row.lr_offset == prev.lr_offset
        });

        if !redundant {
            self.inner.push(row);
            self.last_kept = Some(row);
        }
    }

    fn finish(&mut self) {
        self.inner.finish();
    }
}

/// Runs the rows through every optimization pass.
pub fn optimize(rows: Vec<CompactUnwindRow>) -> Vec<CompactUnwindRow> {
    let mut pipeline = RemoveUnnecessaryMarkers::new(RemoveRedundant::new(VecSink::default()));
    for row in rows {
        pipeline.push(row);
    }
    pipeline.finish();
    pipeline.into_inner().into_inner().into_vec()
}
