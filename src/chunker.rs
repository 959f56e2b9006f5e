//! Troceado de texto en ventanas de caracteres con solapamiento.
//!
//! El texto se corta primero por el separador (párrafos por defecto); los
//! trozos que superan `chunk_size` se parten en ventanas fijas y después se
//! agrupan de forma voraz sin pasar nunca de `chunk_size` caracteres,
//! arrastrando al siguiente chunk hasta `chunk_overlap` caracteres del anterior.

use std::collections::VecDeque;

use anyhow::{anyhow, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separator: String,
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            separator: "\n\n".to_string(),
        }
    }
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 || chunk_overlap >= chunk_size {
            return Err(anyhow!(
                "El solapamiento ({chunk_overlap}) debe ser menor que el tamaño de chunk ({chunk_size})"
            ));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
            ..Self::default()
        })
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let pieces: Vec<String> = text
            .split(self.separator.as_str())
            .map(str::trim)
            .filter(|piece| !piece.is_empty())
            .flat_map(|piece| self.windows(piece))
            .collect();
        self.merge(pieces)
    }

    /// Ventanas fijas de `chunk_size` caracteres que avanzan
    /// `chunk_size - chunk_overlap`.
    fn windows(&self, piece: &str) -> Vec<String> {
        let chars: Vec<char> = piece.chars().collect();
        if chars.len() <= self.chunk_size {
            return vec![piece.to_string()];
        }

        let step = self.chunk_size - self.chunk_overlap;
        let mut windows = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + self.chunk_size).min(chars.len());
            windows.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start += step;
        }
        windows
    }

    fn merge(&self, pieces: Vec<String>) -> Vec<String> {
        let sep_len = self.separator.chars().count();
        let mut chunks = Vec::new();
        let mut current: VecDeque<(String, usize)> = VecDeque::new();
        // Longitud de `current` unido con el separador.
        let mut total = 0usize;

        for piece in pieces {
            let len = piece.chars().count();

            if !current.is_empty() && total + sep_len + len > self.chunk_size {
                self.flush(&current, &mut chunks);
                while !current.is_empty()
                    && (total > self.chunk_overlap || total + sep_len + len > self.chunk_size)
                {
                    let Some((_, removed)) = current.pop_front() else { break };
                    total = if current.is_empty() { 0 } else { total - removed - sep_len };
                }
            }

            total = if current.is_empty() { len } else { total + sep_len + len };
            current.push_back((piece, len));
        }

        self.flush(&current, &mut chunks);
        chunks
    }

    fn flush(&self, current: &VecDeque<(String, usize)>, chunks: &mut Vec<String>) {
        if current.is_empty() {
            return;
        }
        let joined = current
            .iter()
            .map(|(piece, _)| piece.as_str())
            .collect::<Vec<_>>()
            .join(&self.separator);
        let trimmed = joined.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
    }
}
