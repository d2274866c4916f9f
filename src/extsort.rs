//! Stable ascending numeric sort that spills to anonymous temporary files
//! once the in-memory buffer fills up. Small inputs never touch the disk;
//! the contract is the ordering, not the mechanism.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    fs::File,
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
};

use eyre::Result;

/// A record that can be externally sorted by a numeric key.
pub(crate) trait SortItem: Sized {
    fn key(&self) -> f64;
    fn encode<W: Write>(&self, wtr: &mut W) -> io::Result<()>;
    fn decode<R: Read>(rdr: &mut R) -> io::Result<Option<Self>>;
}

pub(crate) struct ExternalSorter<T> {
    limit: usize,
    buf: Vec<T>,
    chunks: Vec<File>,
}

impl<T: SortItem> ExternalSorter<T> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            buf: Vec::new(),
            chunks: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, item: T) -> Result<()> {
        self.buf.push(item);
        if self.buf.len() >= self.limit {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        self.buf.sort_by(|a, b| a.key().total_cmp(&b.key()));
        let mut wtr = BufWriter::new(tempfile::tempfile()?);
        for item in self.buf.drain(..) {
            item.encode(&mut wtr)?;
        }
        let mut chunk = wtr.into_inner().map_err(|e| e.into_error())?;
        chunk.seek(SeekFrom::Start(0))?;
        self.chunks.push(chunk);
        Ok(())
    }

    /// Consumes the sorter, yielding every record in ascending key order.
    /// Records with equal keys come out in insertion order.
    pub(crate) fn finish(mut self) -> Result<SortedItems<T>> {
        self.buf.sort_by(|a, b| a.key().total_cmp(&b.key()));
        if self.chunks.is_empty() {
            return Ok(SortedItems::Memory(self.buf.into_iter()));
        }
        let mut sources: Vec<Source<T>> = self
            .chunks
            .into_iter()
            .map(|chunk| Source::Chunk(BufReader::new(chunk)))
            .collect();
        sources.push(Source::Memory(self.buf.into_iter()));
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (src, source) in sources.iter_mut().enumerate() {
            if let Some(item) = source.next_item()? {
                heap.push(HeapEntry {
                    key: item.key(),
                    src,
                    item,
                });
            }
        }
        Ok(SortedItems::Merge { sources, heap })
    }
}

pub(crate) enum Source<T> {
    Chunk(BufReader<File>),
    Memory(std::vec::IntoIter<T>),
}

impl<T: SortItem> Source<T> {
    fn next_item(&mut self) -> io::Result<Option<T>> {
        match self {
            Source::Chunk(rdr) => T::decode(rdr),
            Source::Memory(iter) => Ok(iter.next()),
        }
    }
}

pub(crate) struct HeapEntry<T> {
    key: f64,
    src: usize,
    item: T,
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for HeapEntry<T> {}

impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for HeapEntry<T> {
    // reversed so the max-heap pops the smallest key; ties go to the
    // earliest chunk, which keeps the merge stable
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .total_cmp(&self.key)
            .then_with(|| other.src.cmp(&self.src))
    }
}

pub(crate) enum SortedItems<T: SortItem> {
    Memory(std::vec::IntoIter<T>),
    Merge {
        sources: Vec<Source<T>>,
        heap: BinaryHeap<HeapEntry<T>>,
    },
}

impl<T: SortItem> Iterator for SortedItems<T> {
    type Item = io::Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            SortedItems::Memory(iter) => iter.next().map(Ok),
            SortedItems::Merge { sources, heap } => {
                let entry = heap.pop()?;
                match sources[entry.src].next_item() {
                    Ok(Some(item)) => heap.push(HeapEntry {
                        key: item.key(),
                        src: entry.src,
                        item,
                    }),
                    Ok(None) => {}
                    Err(e) => return Some(Err(e)),
                }
                Some(Ok(entry.item))
            }
        }
    }
}
