use std::fmt::{Debug, Display, Formatter};
use std::slice;
use std::str::FromStr;

use bit_set::BitSet;
use instant::{Duration, Instant};
use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use smallvec::SmallVec;
use thiserror::Error;

/// The expected maximum length for a single word. Longer words still work, their letters just
/// spill onto the heap.
pub const MAX_INLINE_WORD_LENGTH: usize = 16;

/// The largest grid we'll allocate, no matter what the options ask for.
pub const MAX_GRID_SIZE: usize = 128;

pub const DEFAULT_WORD_COUNT: usize = 10;
pub const DEFAULT_MAX_ATTEMPTS: usize = 1000;
pub const DEFAULT_MAX_GRID_SIZE: usize = 15;
pub const DEFAULT_MIN_WORD_LENGTH: usize = 3;

/// How many times a single word may fail to find an anchor before it's dropped from the pool for
/// the rest of the attempt.
pub const DEFAULT_MAX_WORD_FAILURES: usize = 5;

/// How many failed placements in a row end an attempt.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: usize = 20;

// Weights for the terms of an attempt's score.
const SCORE_PER_WORD: f64 = 100.0;
const SCORE_PER_INTERSECTION: f64 = 50.0;
const SCORE_PER_COMPACTNESS: f64 = 30.0;
const SCORE_PER_AREA_EFFICIENCY: f64 = 20.0;

/// Zero-indexed (row, col) coords for a cell in the grid, where row = 0 is the top row.
pub type GridCoord = (usize, usize);

/// Inline letter buffer for a word.
pub type Letters = SmallVec<[char; MAX_INLINE_WORD_LENGTH]>;

/// Direction that a word runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Horizontal,
    Vertical,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Horizontal => Direction::Vertical,
            Direction::Vertical => Direction::Horizontal,
        }
    }

    /// The (row, col) offset between consecutive letters of a run in this direction.
    fn step(self) -> (isize, isize) {
        match self {
            Direction::Horizontal => (0, 1),
            Direction::Vertical => (1, 0),
        }
    }

    /// The (row, col) offsets of the two cells flanking each letter of a run in this direction.
    fn sides(self) -> [(isize, isize); 2] {
        match self {
            Direction::Horizontal => [(-1, 0), (1, 0)],
            Direction::Vertical => [(0, -1), (0, 1)],
        }
    }
}

/// How hard the validator looks at the cells beside a proposed word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    Strict,
    #[default]
    Normal,
    Lenient,
}

#[derive(Debug, Error)]
#[error("unknown validation level `{0}`, expected one of: strict, normal, lenient")]
pub struct UnknownValidationLevel(String);

impl FromStr for ValidationLevel {
    type Err = UnknownValidationLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(ValidationLevel::Strict),
            "normal" => Ok(ValidationLevel::Normal),
            "lenient" => Ok(ValidationLevel::Lenient),
            _ => Err(UnknownValidationLevel(s.to_string())),
        }
    }
}

/// The ways a piece of the search can come up empty. None of these escape `generate_crossword`;
/// they're how the optimizer decides what to do next.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationFailure {
    #[error("no word survived length filtering")]
    SelectionExhausted,
    #[error("no valid anchor for `{word}`")]
    PlacementExhausted { word: String },
    #[error("no word could be placed in {attempts} attempts")]
    GenerationExhausted { attempts: usize },
}

/// Options as handed over by the caller. Everything is optional and signed so that junk input
/// can be represented; `settings` turns this into something the engine can trust.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrosswordOptions {
    pub word_count: i64,
    pub max_attempts: i64,
    pub max_grid_size: i64,
    pub validation_level: ValidationLevel,
    pub min_word_length: i64,
    /// Defaults to `max_grid_size`, and is never allowed to exceed it.
    pub max_word_length: Option<i64>,
    pub max_word_failures: i64,
    pub max_consecutive_failures: i64,
    /// Seed for the generator used by `generate_crossword`. Fresh entropy if unset.
    pub seed: Option<u64>,
}

impl Default for CrosswordOptions {
    fn default() -> Self {
        CrosswordOptions {
            word_count: DEFAULT_WORD_COUNT as i64,
            max_attempts: DEFAULT_MAX_ATTEMPTS as i64,
            max_grid_size: DEFAULT_MAX_GRID_SIZE as i64,
            validation_level: ValidationLevel::default(),
            min_word_length: DEFAULT_MIN_WORD_LENGTH as i64,
            max_word_length: None,
            max_word_failures: DEFAULT_MAX_WORD_FAILURES as i64,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES as i64,
            seed: None,
        }
    }
}

impl CrosswordOptions {
    /// Clamp the raw options into usable settings. Anything non-positive falls back to its
    /// default rather than failing the call.
    pub fn settings(&self) -> GenerationSettings {
        let mut max_grid_size =
            positive_or("maxGridSize", self.max_grid_size, DEFAULT_MAX_GRID_SIZE);
        if max_grid_size > MAX_GRID_SIZE {
            warn!("option maxGridSize = {} is too large, using {}", max_grid_size, MAX_GRID_SIZE);
            max_grid_size = MAX_GRID_SIZE;
        }

        let max_word_length = match self.max_word_length {
            Some(length) => positive_or("maxWordLength", length, max_grid_size).min(max_grid_size),
            None => max_grid_size,
        };

        GenerationSettings {
            word_count: positive_or("wordCount", self.word_count, DEFAULT_WORD_COUNT),
            max_attempts: positive_or("maxAttempts", self.max_attempts, DEFAULT_MAX_ATTEMPTS),
            max_grid_size,
            validation_level: self.validation_level,
            min_word_length: positive_or(
                "minWordLength",
                self.min_word_length,
                DEFAULT_MIN_WORD_LENGTH,
            ),
            max_word_length,
            max_word_failures: positive_or(
                "maxWordFailures",
                self.max_word_failures,
                DEFAULT_MAX_WORD_FAILURES,
            ),
            max_consecutive_failures: positive_or(
                "maxConsecutiveFailures",
                self.max_consecutive_failures,
                DEFAULT_MAX_CONSECUTIVE_FAILURES,
            ),
        }
    }
}

fn positive_or(name: &str, value: i64, default: usize) -> usize {
    match usize::try_from(value) {
        Ok(value) if value > 0 => value,
        _ => {
            warn!("option {} = {} is not positive, using {}", name, value, default);
            default
        }
    }
}

/// Validated settings for a generation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSettings {
    pub word_count: usize,
    pub max_attempts: usize,
    pub max_grid_size: usize,
    pub validation_level: ValidationLevel,
    pub min_word_length: usize,
    pub max_word_length: usize,
    pub max_word_failures: usize,
    pub max_consecutive_failures: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        CrosswordOptions::default().settings()
    }
}

/// A single grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cell {
    #[default]
    Empty,
    Letter(char),
}

impl Cell {
    pub fn is_empty(self) -> bool {
        matches!(self, Cell::Empty)
    }

    pub fn letter(self) -> Option<char> {
        match self {
            Cell::Letter(letter) => Some(letter),
            Cell::Empty => None,
        }
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Cell::Empty => serializer.serialize_none(),
            Cell::Letter(letter) => serializer.serialize_char(letter),
        }
    }
}

/// A row-major buffer of cells. Attempts always work on a square grid; trimming produces
/// rectangular ones.
#[derive(Clone, PartialEq, Eq)]
pub struct Grid {
    width: usize,
    height: usize,
    cells: Vec<Cell>,
}

impl Grid {
    /// A square grid with every cell empty.
    pub fn new(size: usize) -> Grid {
        Grid { width: size, height: size, cells: vec![Cell::Empty; size * size] }
    }

    /// A grid with no cells at all.
    pub fn empty() -> Grid {
        Grid::new(0)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Panics if (row, col) is outside the grid.
    pub fn get(&self, row: usize, col: usize) -> Cell {
        self.cells[self.index(row, col)]
    }

    /// Look up a cell by signed coords, returning `None` for anything off the grid.
    pub fn cell(&self, row: isize, col: isize) -> Option<Cell> {
        let row = usize::try_from(row).ok()?;
        let col = usize::try_from(col).ok()?;

        if row < self.height && col < self.width {
            Some(self.get(row, col))
        } else {
            None
        }
    }

    /// Iterate over the rows of the grid, top to bottom.
    pub fn rows(&self) -> impl Iterator<Item = &[Cell]> {
        self.cells.chunks(self.width.max(1))
    }

    pub fn filled_cell_count(&self) -> usize {
        self.cells.iter().filter(|cell| !cell.is_empty()).count()
    }

    fn is_occupied(&self, row: isize, col: isize) -> bool {
        self.cell(row, col).map(|cell| !cell.is_empty()).unwrap_or(false)
    }

    fn index(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    /// Write a placed word's letters into the grid. This is the only way cells get filled.
    fn place(&mut self, placed_word: &PlacedWord) {
        for ((row, col), &letter) in placed_word.cells().zip(&placed_word.letters) {
            let idx = self.index(row, col);
            self.cells[idx] = Cell::Letter(letter);
        }
    }
}

impl Debug for Grid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grid")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("filled", &self.filled_cell_count())
            .finish()
    }
}

/// Renders one line per row, with `.` for empty cells.
impl Display for Grid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (row_idx, row) in self.rows().enumerate() {
            if row_idx > 0 {
                writeln!(f)?;
            }
            for cell in row {
                write!(f, "{}", cell.letter().unwrap_or('.'))?;
            }
        }

        Ok(())
    }
}

impl Serialize for Grid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.height))?;
        for row in self.rows() {
            seq.serialize_element(row)?;
        }
        seq.end()
    }
}

/// A normalized candidate word: trimmed, uppercased, never empty. `new` is the only way to build
/// one, so the text and letters always agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    text: String,
    letters: Letters,
}

impl Word {
    pub fn new(raw: &str) -> Option<Word> {
        let text = raw.trim().to_uppercase();
        if text.is_empty() {
            return None;
        }

        let letters = text.chars().collect();
        Some(Word { text, letters })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn letters(&self) -> &[char] {
        &self.letters
    }

    pub fn len(&self) -> usize {
        self.letters.len()
    }
}

/// Normalize a raw word list, dropping anything that's blank.
pub fn normalize_words<S: AsRef<str>>(words: &[S]) -> Vec<Word> {
    words.iter().filter_map(|word| Word::new(word.as_ref())).collect()
}

/// Pick up to `count` words with lengths in `min_length..=max_length`, in random order. Fails if
/// that leaves nothing to place, which includes a `count` of 0.
pub fn select_words<R: Rng + ?Sized>(
    words: &[Word],
    min_length: usize,
    max_length: usize,
    count: usize,
    rng: &mut R,
) -> Result<Vec<Word>, GenerationFailure> {
    let mut selected: Vec<Word> = words
        .iter()
        .filter(|word| (min_length..=max_length).contains(&word.len()))
        .cloned()
        .collect();

    selected.shuffle(rng);
    selected.truncate(count);

    if selected.is_empty() {
        return Err(GenerationFailure::SelectionExhausted);
    }

    Ok(selected)
}

/// A word that has been committed to a grid. The end coords are always derived from the start,
/// direction and length, so the only ways to get one are `new` and `translated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedWord {
    text: String,
    start_row: usize,
    start_col: usize,
    direction: Direction,
    end_row: usize,
    end_col: usize,
    #[serde(skip)]
    letters: Letters,
}

impl PlacedWord {
    pub fn new(
        word: &Word,
        start_row: usize,
        start_col: usize,
        direction: Direction,
    ) -> PlacedWord {
        let letters = word.letters.clone();
        PlacedWord::derive(word.text.clone(), letters, start_row, start_col, direction)
    }

    /// A copy of this word moved up by `row_offset` and left by `col_offset`.
    pub fn translated(&self, row_offset: usize, col_offset: usize) -> PlacedWord {
        PlacedWord::derive(
            self.text.clone(),
            self.letters.clone(),
            self.start_row - row_offset,
            self.start_col - col_offset,
            self.direction,
        )
    }

    fn derive(
        text: String,
        letters: Letters,
        start_row: usize,
        start_col: usize,
        direction: Direction,
    ) -> PlacedWord {
        let last = letters.len() - 1;
        let (end_row, end_col) = match direction {
            Direction::Horizontal => (start_row, start_col + last),
            Direction::Vertical => (start_row + last, start_col),
        };

        PlacedWord { text, start_row, start_col, direction, end_row, end_col, letters }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn letters(&self) -> &[char] {
        &self.letters
    }

    pub fn len(&self) -> usize {
        self.letters.len()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn start_row(&self) -> usize {
        self.start_row
    }

    pub fn start_col(&self) -> usize {
        self.start_col
    }

    pub fn end_row(&self) -> usize {
        self.end_row
    }

    pub fn end_col(&self) -> usize {
        self.end_col
    }

    /// Generate the coords for each cell of this word, in order.
    pub fn cells(&self) -> impl Iterator<Item = GridCoord> + '_ {
        (0..self.len()).map(move |offset| match self.direction {
            Direction::Horizontal => (self.start_row, self.start_col + offset),
            Direction::Vertical => (self.start_row + offset, self.start_col),
        })
    }

    /// Where (row, col) falls within this word, if it's covered at all.
    pub fn offset_of(&self, row: usize, col: usize) -> Option<usize> {
        match self.direction {
            Direction::Horizontal
                if row == self.start_row && (self.start_col..=self.end_col).contains(&col) =>
            {
                Some(col - self.start_col)
            }
            Direction::Vertical
                if col == self.start_col && (self.start_row..=self.end_row).contains(&row) =>
            {
                Some(row - self.start_row)
            }
            _ => None,
        }
    }

    pub fn letter_at(&self, row: usize, col: usize) -> Option<char> {
        self.offset_of(row, col).map(|offset| self.letters[offset])
    }
}

/// A proposed starting cell and direction for a word. Candidates come straight from letter
/// matching, so the coords can be negative or past the edge of the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub row: isize,
    pub col: isize,
    pub direction: Direction,
}

/// The cells a word of `len` letters would cover from `anchor`, or `None` if any of them is off
/// the grid.
fn run_coords(
    grid: &Grid,
    len: usize,
    anchor: Anchor,
) -> Option<SmallVec<[GridCoord; MAX_INLINE_WORD_LENGTH]>> {
    let (row_step, col_step) = anchor.direction.step();

    (0..len as isize)
        .map(|offset| {
            let row = anchor.row + row_step * offset;
            let col = anchor.col + col_step * offset;
            grid.cell(row, col).map(|_| (row as usize, col as usize))
        })
        .collect()
}

/// Find a recorded word running across `direction` that covers (row, col) with `letter`.
fn crossing_word(
    placed_words: &[PlacedWord],
    row: usize,
    col: usize,
    letter: char,
    direction: Direction,
) -> Option<&PlacedWord> {
    placed_words.iter().find(|placed_word| {
        placed_word.direction != direction && placed_word.letter_at(row, col) == Some(letter)
    })
}

/// Decide whether `word` may be written at `anchor`. This never touches the grid.
pub fn can_place(
    grid: &Grid,
    word: &Word,
    anchor: Anchor,
    placed_words: &[PlacedWord],
    level: ValidationLevel,
) -> bool {
    let run = match run_coords(grid, word.len(), anchor) {
        Some(run) => run,
        None => return false,
    };

    // Every cell has to be empty or already hold the same letter. Shared letters are only ever
    // crossings, so a cell covered by a word running the same way is off limits.
    for (&(row, col), &letter) in run.iter().zip(&word.letters) {
        match grid.get(row, col) {
            Cell::Empty => {}
            Cell::Letter(existing) if existing == letter => {
                let overlaps_parallel_word = placed_words.iter().any(|placed_word| {
                    placed_word.direction == anchor.direction
                        && placed_word.offset_of(row, col).is_some()
                });

                if overlaps_parallel_word {
                    return false;
                }
            }
            Cell::Letter(_) => return false,
        }
    }

    // Nothing may sit directly before or after the word, or it would read as a longer one.
    let (row_step, col_step) = anchor.direction.step();
    let len = word.len() as isize;
    if {
        grid.is_occupied(anchor.row - row_step, anchor.col - col_step) ||
            grid.is_occupied(anchor.row + row_step * len, anchor.col + col_step * len)
    } {
        return false;
    }

    // A letter beside the run is only acceptable where the run crosses a recorded word.
    for (&(row, col), &letter) in run.iter().zip(&word.letters) {
        let has_side_letters = anchor.direction.sides().iter().any(|&(row_offset, col_offset)| {
            grid.is_occupied(row as isize + row_offset, col as isize + col_offset)
        });

        if {
            has_side_letters &&
                crossing_word(placed_words, row, col, letter, anchor.direction).is_none()
        } {
            return false;
        }
    }

    if level == ValidationLevel::Strict {
        // Each side letter must itself belong to a word that crosses the run at this cell.
        for &(row, col) in &run {
            for &(row_offset, col_offset) in &anchor.direction.sides() {
                let (side_row, side_col) = (row as isize + row_offset, col as isize + col_offset);
                if !grid.is_occupied(side_row, side_col) {
                    continue;
                }

                let (side_row, side_col) = (side_row as usize, side_col as usize);
                let crossed = placed_words.iter().any(|placed_word| {
                    placed_word.direction != anchor.direction
                        && placed_word.offset_of(row, col).is_some()
                        && placed_word.offset_of(side_row, side_col).is_some()
                });

                if !crossed {
                    return false;
                }
            }
        }
    }

    true
}

/// List every anchor at which `word` would cross one of `placed_words` on a matching letter.
/// Anchors always run perpendicular to the word they cross. Nothing here checks bounds or
/// legality; that's `can_place`'s job.
pub fn find_intersections(word: &Word, placed_words: &[PlacedWord]) -> Vec<Anchor> {
    let mut anchors = vec![];

    for placed_word in placed_words {
        let start_row = placed_word.start_row as isize;
        let start_col = placed_word.start_col as isize;

        for (word_idx, &letter) in word.letters.iter().enumerate() {
            for (placed_idx, &placed_letter) in placed_word.letters.iter().enumerate() {
                if letter != placed_letter {
                    continue;
                }

                let (word_idx, placed_idx) = (word_idx as isize, placed_idx as isize);
                let (row, col) = match placed_word.direction {
                    Direction::Horizontal => (start_row - word_idx, start_col + placed_idx),
                    Direction::Vertical => (start_row + placed_idx, start_col - word_idx),
                };

                anchors.push(Anchor { row, col, direction: placed_word.direction.opposite() });
            }
        }
    }

    anchors
}

/// Pick a random start coord in `0..=max_start`, keeping `margin` cells clear on either side
/// where there's room to.
fn centered_start<R: Rng + ?Sized>(max_start: usize, margin: usize, rng: &mut R) -> usize {
    let low = margin.min(max_start);
    let high = max_start.saturating_sub(margin).max(low);

    rng.gen_range(low..=high)
}

/// Choose where the first word of an attempt goes: random orientation, somewhere near the middle
/// so later words have room to grow in every direction. Assumes the word fits in the grid.
fn seed_anchor<R: Rng + ?Sized>(grid_size: usize, word_len: usize, rng: &mut R) -> Anchor {
    let direction = if rng.gen_bool(0.5) { Direction::Horizontal } else { Direction::Vertical };
    let margin = grid_size / 4;

    let along = centered_start(grid_size - word_len, margin, rng) as isize;
    let across = centered_start(grid_size - 1, margin, rng) as isize;

    match direction {
        Direction::Horizontal => Anchor { row: across, col: along, direction },
        Direction::Vertical => Anchor { row: along, col: across, direction },
    }
}

/// A candidate word that hasn't been placed yet, and how often it has failed to find a spot.
#[derive(Debug)]
struct PoolEntry {
    word: Word,
    failures: usize,
}

/// Retry bookkeeping for one attempt. A word is evicted from the pool once it has failed
/// `max_word_failures` times, and the attempt gives up after `max_consecutive_failures`
/// failures in a row. Success and eviction both clear the run of failures.
#[derive(Debug, Clone, Copy)]
struct FailureBudget {
    max_word_failures: usize,
    max_consecutive_failures: usize,
    consecutive: usize,
}

impl FailureBudget {
    fn new(settings: &GenerationSettings) -> FailureBudget {
        FailureBudget {
            max_word_failures: settings.max_word_failures,
            max_consecutive_failures: settings.max_consecutive_failures,
            consecutive: 0,
        }
    }

    fn exhausted(&self) -> bool {
        self.consecutive >= self.max_consecutive_failures
    }

    fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Charge a failed placement to `entry`. Returns true when the word should be evicted.
    fn record_failure(&mut self, entry: &mut PoolEntry) -> bool {
        entry.failures += 1;

        if entry.failures >= self.max_word_failures {
            self.consecutive = 0;
            true
        } else {
            self.consecutive += 1;
            false
        }
    }
}

/// The mutable state of a single attempt. Each attempt owns its own and throws it away at the
/// end; nothing is shared or reset between attempts.
struct GenerationState {
    attempt: usize,
    grid: Grid,
    placed_words: Vec<PlacedWord>,
    pool: Vec<PoolEntry>,
}

impl Debug for GenerationState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationState")
            .field("attempt", &self.attempt)
            .field("grid", &self.grid)
            .field("placed_words", &self.placed_words.len())
            .field("pool", &self.pool.len())
            .finish()
    }
}

impl GenerationState {
    fn new(attempt: usize, grid_size: usize, pool: Vec<Word>) -> GenerationState {
        GenerationState {
            attempt,
            grid: Grid::new(grid_size),
            placed_words: vec![],
            pool: pool.into_iter().map(|word| PoolEntry { word, failures: 0 }).collect(),
        }
    }

    fn commit(&mut self, word: &Word, anchor: Anchor) {
        let placed_word =
            PlacedWord::new(word, anchor.row as usize, anchor.col as usize, anchor.direction);

        trace!(
            "attempt {}: placed {} at ({}, {}) {:?}",
            self.attempt, placed_word.text, placed_word.start_row, placed_word.start_col,
            placed_word.direction,
        );

        self.grid.place(&placed_word);
        self.placed_words.push(placed_word);
    }

    /// Try every crossing of `word` with the words placed so far, in random order, and return the
    /// first one the validator accepts.
    fn find_anchor<R: Rng + ?Sized>(
        &self,
        word: &Word,
        level: ValidationLevel,
        rng: &mut R,
    ) -> Result<Anchor, GenerationFailure> {
        let mut anchors = find_intersections(word, &self.placed_words);
        anchors.shuffle(rng);

        anchors
            .into_iter()
            .find(|&anchor| can_place(&self.grid, word, anchor, &self.placed_words, level))
            .ok_or_else(|| GenerationFailure::PlacementExhausted { word: word.text.clone() })
    }
}

/// A finished attempt, scored and ready to be compared with the others.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub index: usize,
    pub grid: Grid,
    pub placed_words: Vec<PlacedWord>,
    pub intersections: usize,
    pub score: f64,
    /// Placements that found no legal crossing, evictions included.
    pub failed_placements: usize,
    pub evicted_words: usize,
}

/// Run one complete attempt: select and shuffle words, seed the grid with the first, then keep
/// crossing new words onto it until the target is met, the pool runs dry, or too many
/// placements fail in a row. Running out of words or patience isn't an error; the attempt just
/// ends up with fewer words.
pub fn run_attempt<R: Rng + ?Sized>(
    words: &[Word],
    settings: &GenerationSettings,
    attempt: usize,
    rng: &mut R,
) -> Result<Attempt, GenerationFailure> {
    let mut selected = select_words(
        words,
        settings.min_word_length,
        settings.max_word_length.min(settings.max_grid_size),
        settings.word_count,
        rng,
    )?;

    let seed_word = selected.remove(0);
    let mut state = GenerationState::new(attempt, settings.max_grid_size, selected);
    let anchor = seed_anchor(settings.max_grid_size, seed_word.len(), rng);
    state.commit(&seed_word, anchor);

    let mut budget = FailureBudget::new(settings);
    let mut failed_placements = 0;
    let mut evicted_words = 0;

    while {
        state.placed_words.len() < settings.word_count &&
            !state.pool.is_empty() &&
            !budget.exhausted()
    } {
        let pick = rng.gen_range(0..state.pool.len());

        match state.find_anchor(&state.pool[pick].word, settings.validation_level, rng) {
            Ok(anchor) => {
                let entry = state.pool.swap_remove(pick);
                state.commit(&entry.word, anchor);
                budget.record_success();
            }
            Err(failure) => {
                failed_placements += 1;

                if budget.record_failure(&mut state.pool[pick]) {
                    trace!(
                        "attempt {}: evicting word after {} failures: {}",
                        attempt, state.pool[pick].failures, failure,
                    );
                    state.pool.swap_remove(pick);
                    evicted_words += 1;
                }
            }
        }
    }

    let intersections = count_intersections(&state.placed_words);
    let score = score_attempt(&state.grid, &state.placed_words, intersections);

    Ok(Attempt {
        index: attempt,
        grid: state.grid,
        placed_words: state.placed_words,
        intersections,
        score,
        failed_placements,
        evicted_words,
    })
}

/// Width and height of a grid or of the area some words cover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GridSize {
    pub width: usize,
    pub height: usize,
}

/// An inclusive rectangle of cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub min_row: usize,
    pub min_col: usize,
    pub max_row: usize,
    pub max_col: usize,
}

impl BoundingBox {
    fn of_cell(row: usize, col: usize) -> BoundingBox {
        BoundingBox { min_row: row, min_col: col, max_row: row, max_col: col }
    }

    fn including(self, row: usize, col: usize) -> BoundingBox {
        BoundingBox {
            min_row: self.min_row.min(row),
            min_col: self.min_col.min(col),
            max_row: self.max_row.max(row),
            max_col: self.max_col.max(col),
        }
    }

    pub fn size(&self) -> GridSize {
        GridSize {
            width: self.max_col - self.min_col + 1,
            height: self.max_row - self.min_row + 1,
        }
    }
}

fn extend_bounds(bounds: Option<BoundingBox>, (row, col): GridCoord) -> Option<BoundingBox> {
    Some(match bounds {
        Some(bounds) => bounds.including(row, col),
        None => BoundingBox::of_cell(row, col),
    })
}

fn word_bounds(placed_words: &[PlacedWord]) -> Option<BoundingBox> {
    placed_words.iter().fold(None, |bounds, placed_word| {
        let bounds = extend_bounds(bounds, (placed_word.start_row, placed_word.start_col));
        extend_bounds(bounds, (placed_word.end_row, placed_word.end_col))
    })
}

/// The smallest box holding every non-empty cell of the grid.
pub fn occupied_bounds(grid: &Grid) -> Option<BoundingBox> {
    grid.rows()
        .enumerate()
        .flat_map(|(row, cells)| {
            cells
                .iter()
                .enumerate()
                .filter(|(_, cell)| !cell.is_empty())
                .map(move |(col, _)| (row, col))
        })
        .fold(None, extend_bounds)
}

/// The size of the smallest grid that could hold the given words where they are.
pub fn calculate_min_grid_size(placed_words: &[PlacedWord]) -> GridSize {
    word_bounds(placed_words).map(|bounds| bounds.size()).unwrap_or_default()
}

/// Count the cells that are shared by two placed words.
pub fn count_intersections(placed_words: &[PlacedWord]) -> usize {
    let bounds = match word_bounds(placed_words) {
        Some(bounds) => bounds,
        None => return 0,
    };
    let width = bounds.size().width;

    let mut covered = BitSet::new();
    let mut intersections = 0;

    for placed_word in placed_words {
        for (row, col) in placed_word.cells() {
            if !covered.insert((row - bounds.min_row) * width + (col - bounds.min_col)) {
                intersections += 1;
            }
        }
    }

    intersections
}

/// Score an attempt; higher is better. Rewards placing words and crossing them, and packing them
/// densely into their bounding box.
pub fn score_attempt(grid: &Grid, placed_words: &[PlacedWord], intersections: usize) -> f64 {
    let size = calculate_min_grid_size(placed_words);
    let area = (size.width * size.height) as f64;
    if area == 0.0 {
        return 0.0;
    }

    let compactness = grid.filled_cell_count() as f64 / area * 100.0;
    let total_letters: usize = placed_words.iter().map(PlacedWord::len).sum();
    let area_efficiency = total_letters as f64 / area * 100.0;

    SCORE_PER_WORD * placed_words.len() as f64 +
        SCORE_PER_INTERSECTION * intersections as f64 +
        SCORE_PER_COMPACTNESS * compactness +
        SCORE_PER_AREA_EFFICIENCY * area_efficiency
}

/// Crop the grid down to its occupied cells and shift the words to match. A grid with nothing
/// in it comes back empty, with the words left alone.
pub fn trim_grid(grid: &Grid, placed_words: &[PlacedWord]) -> (Grid, Vec<PlacedWord>) {
    let bounds = match occupied_bounds(grid) {
        Some(bounds) => bounds,
        None => return (Grid::empty(), placed_words.to_vec()),
    };
    let size = bounds.size();

    let mut cells = Vec::with_capacity(size.width * size.height);
    for row in bounds.min_row..=bounds.max_row {
        cells.extend_from_slice(
            &grid.cells[grid.index(row, bounds.min_col)..=grid.index(row, bounds.max_col)],
        );
    }

    let trimmed = Grid { width: size.width, height: size.height, cells };
    let placed_words = placed_words
        .iter()
        .map(|placed_word| placed_word.translated(bounds.min_row, bounds.min_col))
        .collect();

    (trimmed, placed_words)
}

/// A struct tracking statistics about a generation run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub words_used: usize,
    pub grid_size: GridSize,
    pub total_intersections: usize,
    pub attempts: usize,
    /// Index of the winning attempt. Unset when the result came from the fallback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_attempt: Option<usize>,
    pub score: f64,
    #[serde(skip)]
    pub duration: Duration,
}

/// The trimmed grid, the words on it in trimmed coords, and how we got there.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrosswordResult {
    pub grid: Grid,
    pub placed_words: Vec<PlacedWord>,
    pub stats: Statistics,
}

/// The winner of a multi-attempt search.
#[derive(Debug)]
pub struct SearchSuccess {
    pub best: Attempt,
    pub attempts: usize,
}

/// Run up to `max_attempts` attempts and keep the best-scoring one. As soon as a new best already
/// places `word_count` words we stop looking, even if a later attempt might have scored higher.
pub fn find_best_attempt<R: Rng + ?Sized>(
    words: &[Word],
    settings: &GenerationSettings,
    rng: &mut R,
) -> Result<SearchSuccess, GenerationFailure> {
    let mut best: Option<Attempt> = None;
    let mut attempts = 0;

    for attempt in 0..settings.max_attempts {
        attempts += 1;

        let candidate = match run_attempt(words, settings, attempt, rng) {
            Ok(candidate) => candidate,
            Err(failure) => {
                debug!("attempt {} abandoned: {}", attempt, failure);

                // Length filtering doesn't depend on the rng, so every later attempt would end up
                // here too. Count them as spent.
                if failure == GenerationFailure::SelectionExhausted {
                    attempts = settings.max_attempts;
                    break;
                }
                continue;
            }
        };

        debug_assert!(!candidate.placed_words.is_empty());

        if best.as_ref().map(|best| candidate.score <= best.score).unwrap_or(false) {
            continue;
        }

        debug!(
            "attempt {}: new best score {:.1} with {} words",
            attempt, candidate.score, candidate.placed_words.len(),
        );

        let target_met = candidate.placed_words.len() >= settings.word_count;
        best = Some(candidate);

        if target_met {
            debug!("attempt {} met the target of {} words, stopping", attempt, settings.word_count);
            break;
        }
    }

    best.map(|best| SearchSuccess { best, attempts })
        .ok_or(GenerationFailure::GenerationExhausted { attempts })
}

fn build_result(
    grid: &Grid,
    placed_words: &[PlacedWord],
    attempts: usize,
    best_attempt: Option<usize>,
    score: f64,
) -> CrosswordResult {
    let (grid, placed_words) = trim_grid(grid, placed_words);

    let stats = Statistics {
        words_used: placed_words.len(),
        grid_size: GridSize { width: grid.width(), height: grid.height() },
        total_intersections: count_intersections(&placed_words),
        attempts,
        best_attempt,
        score,
        duration: Duration::from_millis(0),
    };

    CrosswordResult { grid, placed_words, stats }
}

/// Put the first word that fits the grid at the top left, ignoring the length bounds. If
/// nothing fits, the result is empty.
fn fallback_result(
    words: &[Word],
    settings: &GenerationSettings,
    attempts: usize,
) -> CrosswordResult {
    let word = match words.iter().find(|word| word.len() <= settings.max_grid_size) {
        Some(word) => word,
        None => return build_result(&Grid::empty(), &[], attempts, None, 0.0),
    };

    let placed_word = PlacedWord::new(word, 0, 0, Direction::Horizontal);
    let mut grid = Grid::new(settings.max_grid_size);
    grid.place(&placed_word);

    let score = score_attempt(&grid, slice::from_ref(&placed_word), 0);
    build_result(&grid, slice::from_ref(&placed_word), attempts, None, score)
}

/// Generate a crossword from `words`, drawing every random choice from `rng`. This always
/// returns a well-formed result: if no attempt manages to place anything, a single word goes in
/// on its own.
pub fn generate_crossword_with_rng<S: AsRef<str>, R: Rng + ?Sized>(
    words: &[S],
    options: &CrosswordOptions,
    rng: &mut R,
) -> CrosswordResult {
    let start = Instant::now();
    let settings = options.settings();
    let words = normalize_words(words);

    let mut result = match find_best_attempt(&words, &settings, rng) {
        Ok(SearchSuccess { best, attempts }) => {
            build_result(&best.grid, &best.placed_words, attempts, Some(best.index), best.score)
        }
        Err(failure) => {
            warn!("{}, falling back to a single word", failure);

            let attempts = match failure {
                GenerationFailure::GenerationExhausted { attempts } => attempts,
                _ => settings.max_attempts,
            };
            fallback_result(&words, &settings, attempts)
        }
    };

    result.stats.duration = start.elapsed();

    info!(
        "placed {} of {} words on a {}x{} grid after {} attempts in {:?}",
        result.stats.words_used, settings.word_count, result.stats.grid_size.width,
        result.stats.grid_size.height, result.stats.attempts, result.stats.duration,
    );

    result
}

/// Generate a crossword from `words`, seeded from `options.seed` when it's set.
pub fn generate_crossword<S: AsRef<str>>(
    words: &[S],
    options: &CrosswordOptions,
) -> CrosswordResult {
    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    generate_crossword_with_rng(words, options, &mut rng)
}
