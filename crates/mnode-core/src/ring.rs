use std::collections::VecDeque;

/// Fixed-capacity FIFO of log lines; the oldest line is evicted once full.
#[derive(Debug, Clone)]
pub struct LogRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogRing {
    /// A zero capacity is clamped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.lines.iter()
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> VecDeque<String> {
        self.lines.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_capacity_lines_in_order() {
        let mut ring = LogRing::new(100);
        for i in 0..250 {
            ring.push(format!("line {i}"));
        }
        assert_eq!(ring.len(), 100);
        let kept: Vec<&String> = ring.iter().collect();
        assert_eq!(kept.first().map(|s| s.as_str()), Some("line 150"));
        assert_eq!(kept.last().map(|s| s.as_str()), Some("line 249"));
        for (offset, line) in kept.iter().enumerate() {
            assert_eq!(**line, format!("line {}", 150 + offset));
        }
    }

    #[test]
    fn below_capacity_nothing_is_evicted() {
        let mut ring = LogRing::new(4);
        ring.push("a".to_string());
        ring.push("b".to_string());
        assert_eq!(ring.snapshot(), VecDeque::from(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut ring = LogRing::new(0);
        ring.push("a".to_string());
        ring.push("b".to_string());
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.iter().collect::<Vec<_>>(), vec!["b"]);
    }
}
