/// Number of chunks `len` bytes split into, given the first-chunk and
/// subsequent-chunk sizes. Empty payloads still take one (empty) chunk.
pub fn chunk_count(len: usize, first: usize, rest: usize) -> usize {
    let first = first.max(1);
    let rest = rest.max(1);
    if len <= first {
        1
    } else {
        1 + (len - first).div_ceil(rest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub index: usize,
    pub data: &'a [u8],
    pub last: bool,
}

#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    data: &'a [u8],
    first: usize,
    rest: usize,
    index: usize,
    count: usize,
    offset: usize,
}

pub fn chunks(data: &[u8], first: usize, rest: usize) -> Chunks<'_> {
    let first = first.max(1);
    let rest = rest.max(1);
    Chunks {
        data,
        first,
        rest,
        index: 0,
        count: chunk_count(data.len(), first, rest),
        offset: 0,
    }
}

impl Chunks<'_> {
    pub fn total(&self) -> usize {
        self.count
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }

        let size = if self.index == 0 { self.first } else { self.rest };
        let end = (self.offset + size).min(self.data.len());
        let chunk = Chunk {
            index: self.index,
            data: &self.data[self.offset..end],
            last: self.index + 1 == self.count,
        };

        self.offset = end;
        self.index += 1;
        Some(chunk)
    }
}
