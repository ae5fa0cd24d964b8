//! End-to-end diarization: loading a recording, clustering, optional VB
//! refinement, stitching and RTTM output, one recording or a batch.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2, Axis};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::ahc::ahc;
use crate::config::DiarizeConfig;
use crate::coupled::coupled_vb_hmm;
use crate::der::{der, hard_labels, one_hot};
use crate::init::{coupled_random_restarts, soft_init, vb_random_restarts, InitMode};
use crate::io::ark::{group_by_recording, read_ark, ArkEntry, EmbeddingName};
use crate::io::rttm::{overlap_intervals, overlap_vector, rasterize, read_rttm, write_rttm, RttmRecord};
use crate::io::timing::{by_recording, read_segments, SegmentTiming};
use crate::plda::Plda;
use crate::similarity::{affinity, SimilarityKind};
use crate::spectral::{nme_spectral_clustering, SpectralResult};
use crate::stitch::{by_time, stitch, Labels, Stitched, Turn, Window};
use crate::transform::XvecTransform;
use crate::vbx::{vb_hmm, EigenvoiceModel, VbInit, VbTrace};
use crate::DiarizeError;

/// Embeddings of one recording with their timing.
#[derive(Debug, Clone)]
pub struct Recording {
    pub id: String,
    pub names: Vec<String>,
    pub channels: Vec<usize>,
    /// `[start, end)` of every window, in seconds.
    pub spans: Vec<(f64, f64)>,
    /// N × D raw embeddings, one row per window.
    pub embeddings: Array2<f64>,
    /// Overlapped-speech intervals, when an overlap hypothesis exists.
    pub overlap: Option<Vec<(f64, f64)>>,
    /// Reference speaker id per window, for DER tracing.
    pub reference: Option<Vec<usize>>,
}

impl Recording {
    /// Pairs archive entries with their timing. Both lists must name the
    /// same windows in the same order.
    pub fn assemble(id: &str, entries: Vec<ArkEntry>, timings: &[SegmentTiming]) -> Result<Self, DiarizeError> {
        let mismatch = |detail: String| DiarizeError::NameMismatch {
            recording: id.to_string(),
            detail,
        };
        if entries.len() != timings.len() {
            return Err(mismatch(format!(
                "{} embeddings but {} timed segments",
                entries.len(),
                timings.len()
            )));
        }
        let n = entries.len();
        let dim = entries.first().map_or(0, |e| e.values.len());
        let mut names = Vec::with_capacity(n);
        let mut channels = Vec::with_capacity(n);
        let mut spans = Vec::with_capacity(n);
        let mut data = Vec::with_capacity(n * dim);
        for (i, (entry, timing)) in entries.into_iter().zip(timings).enumerate() {
            if entry.name != timing.name {
                return Err(mismatch(format!("window {i}: {:?} vs {:?}", entry.name, timing.name)));
            }
            if entry.values.len() != dim {
                return Err(DiarizeError::DimensionMismatch {
                    expected: dim,
                    got: entry.values.len(),
                });
            }
            channels.push(EmbeddingName::parse(&entry.name)?.channel);
            spans.push((timing.start, timing.end));
            data.extend_from_slice(&entry.values);
            names.push(entry.name);
        }
        let embeddings =
            Array2::from_shape_vec((n, dim), data).map_err(|e| DiarizeError::Numerical(e.to_string()))?;
        Ok(Self {
            id: id.to_string(),
            names,
            channels,
            spans,
            embeddings,
            overlap: None,
            reference: None,
        })
    }

    /// Loads every recording of an archive, with timing from `segments`
    /// and, optionally, overlap intervals from an RTTM. Unreadable files
    /// fail the whole load; a recording that does not match its timing is
    /// logged and reported in [`LoadedArchive::failed`].
    pub fn load(ark: &Path, segments: &Path, overlap: Option<&Path>) -> Result<LoadedArchive, DiarizeError> {
        let entries = read_ark(BufReader::new(File::open(ark)?), &ark.display().to_string())?;
        let timings = by_recording(read_segments(
            BufReader::new(File::open(segments)?),
            &segments.display().to_string(),
        )?);
        let overlaps = match overlap {
            Some(path) => Some(records_by_recording(read_rttm_file(path)?)),
            None => None,
        };

        let mut out = LoadedArchive::default();
        for (id, entries) in group_by_recording(entries)? {
            let assembled = match timings.get(&id) {
                Some(timing) => Self::assemble(&id, entries, timing),
                None => Err(DiarizeError::NameMismatch {
                    recording: id.clone(),
                    detail: "no timed segments".into(),
                }),
            };
            match assembled {
                Ok(mut rec) => {
                    if let Some(map) = &overlaps {
                        rec.overlap = Some(map.get(&id).map(|r| overlap_intervals(r)).unwrap_or_default());
                    }
                    out.recordings.push(rec);
                }
                Err(e) => {
                    error!(recording = %id, error = %e, "skipping recording");
                    out.failed.push(RecordingFailure::new(&id, &e));
                }
            }
        }
        Ok(out)
    }

    pub fn with_overlap(mut self, intervals: Vec<(f64, f64)>) -> Self {
        self.overlap = Some(intervals);
        self
    }

    /// Labels every window with the reference speaker at its midpoint.
    /// Windows no reference turn covers share one extra id.
    pub fn with_reference(mut self, records: &[RttmRecord]) -> Self {
        let mut ids: HashMap<&str, usize> = HashMap::new();
        let mut labels = Vec::with_capacity(self.len());
        let mut silent = Vec::new();
        for (i, &(start, end)) in self.spans.iter().enumerate() {
            let mid = 0.5 * (start + end);
            match records.iter().find(|r| r.start <= mid && mid < r.end()) {
                Some(r) => {
                    let next = ids.len();
                    labels.push(*ids.entry(r.speaker.as_str()).or_insert(next));
                }
                None => {
                    labels.push(0);
                    silent.push(i);
                }
            }
        }
        let none = ids.len();
        for i in silent {
            labels[i] = none;
        }
        self.reference = Some(labels);
        self
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Reads a whole RTTM file.
pub fn read_rttm_file(path: &Path) -> Result<Vec<RttmRecord>, DiarizeError> {
    read_rttm(BufReader::new(File::open(path)?), &path.display().to_string())
}

/// Splits RTTM records by recording id, keeping file order.
pub fn records_by_recording(records: Vec<RttmRecord>) -> HashMap<String, Vec<RttmRecord>> {
    let mut map: HashMap<String, Vec<RttmRecord>> = HashMap::new();
    for r in records {
        map.entry(r.recording.clone()).or_default().push(r);
    }
    map
}

/// Windows of both channels that start together.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub start: f64,
    pub end: f64,
    /// Embedding row feeding each stream. A region seen on one channel
    /// only uses the same row for both.
    pub rows: [usize; 2],
}

/// Groups windows by start time into two-stream regions, ordered by start.
pub fn coupled_regions(channels: &[usize], spans: &[(f64, f64)]) -> Vec<Region> {
    let mut order: Vec<usize> = (0..spans.len()).collect();
    order.sort_by(|&a, &b| spans[a].0.total_cmp(&spans[b].0));

    let mut grouped: Vec<(f64, f64, [Option<usize>; 2])> = Vec::new();
    for i in order {
        let (start, end) = spans[i];
        let ch = channels[i].min(1);
        match grouped.last_mut() {
            Some((s, e, rows)) if *s == start => {
                *e = e.max(end);
                rows[ch].get_or_insert(i);
            }
            _ => {
                let mut rows = [None, None];
                rows[ch] = Some(i);
                grouped.push((start, end, rows));
            }
        }
    }
    grouped
        .into_iter()
        .filter_map(|(start, end, [a, b])| {
            let first = a.or(b)?;
            Some(Region {
                start,
                end,
                rows: [first, b.unwrap_or(first)],
            })
        })
        .collect()
}

/// Recordings read from one archive.
#[derive(Debug, Default)]
pub struct LoadedArchive {
    pub recordings: Vec<Recording>,
    /// Recordings that could not be assembled.
    pub failed: Vec<RecordingFailure>,
}

/// A recording that could not be loaded or diarized.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingFailure {
    pub id: String,
    pub error: String,
}

impl RecordingFailure {
    pub fn new(id: &str, error: &DiarizeError) -> Self {
        Self {
            id: id.to_string(),
            error: error.to_string(),
        }
    }
}

/// Result of diarizing one recording.
#[derive(Debug, Clone)]
pub struct Diarization {
    pub recording: String,
    /// Labels of every window handed to the stitcher.
    pub labels: Vec<Labels>,
    pub num_speakers: usize,
    pub stitched: Stitched,
    /// VB iteration trace, when VB ran.
    pub trace: Option<VbTrace>,
}

/// Serializable overview of a [`Diarization`].
#[derive(Debug, Clone, Serialize)]
pub struct DiarizationSummary {
    pub recording: String,
    pub windows: usize,
    pub num_speakers: usize,
    pub turns: usize,
    pub speech_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_elbo: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vb_iterations: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_der: Option<f64>,
}

impl Diarization {
    /// Turns in time order. RTTM output keeps the stitcher's
    /// `(label, start)` order instead.
    pub fn timeline(&self) -> Vec<Turn> {
        let mut turns = self.stitched.turns.clone();
        by_time(&mut turns);
        turns
    }

    pub fn write_rttm<W: Write>(&self, w: W) -> Result<(), DiarizeError> {
        write_rttm(w, &self.recording, &self.stitched.turns)
    }

    pub fn save_rttm(&self, path: &Path) -> Result<(), DiarizeError> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_rttm(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn summary(&self) -> DiarizationSummary {
        DiarizationSummary {
            recording: self.recording.clone(),
            windows: self.labels.len(),
            num_speakers: self.num_speakers,
            turns: self.stitched.turns.len(),
            speech_seconds: self.stitched.turns.iter().map(Turn::duration).sum(),
            final_elbo: self.trace.as_ref().map(VbTrace::final_elbo),
            vb_iterations: self.trace.as_ref().map(|t| t.iterations.len()),
            final_der: self
                .trace
                .as_ref()
                .and_then(|t| t.iterations.last().unwrap_or(&t.initial).der),
        }
    }
}

/// VB feature space and emission model derived from the PLDA.
#[derive(Debug, Clone)]
struct VbBackend {
    plda: Plda,
    model: EigenvoiceModel,
}

/// Diarizes recordings with one fixed configuration and model set.
#[derive(Debug, Clone)]
pub struct Diarizer {
    config: DiarizeConfig,
    transform: Option<XvecTransform>,
    plda: Option<Plda>,
    vb: Option<VbBackend>,
}

impl Diarizer {
    /// Validates the configuration against the available models. VB init
    /// modes and PLDA similarity need a PLDA model.
    pub fn new(
        config: DiarizeConfig,
        transform: Option<XvecTransform>,
        plda: Option<Plda>,
    ) -> Result<Self, DiarizeError> {
        config.validate()?;
        if config.similarity == SimilarityKind::Plda && plda.is_none() {
            return Err(DiarizeError::Config("PLDA similarity needs a PLDA model".into()));
        }
        if let (Some(t), Some(p)) = (&transform, &plda) {
            if t.output_dim() != p.dim() {
                return Err(DiarizeError::DimensionMismatch {
                    expected: p.dim(),
                    got: t.output_dim(),
                });
            }
        }
        let vb = if config.needs_vb() {
            let plda = plda.as_ref().ok_or_else(|| {
                DiarizeError::Config(format!("init mode {} needs a PLDA model", config.init))
            })?;
            let sorted = plda.sorted_by_variance()?;
            let model = EigenvoiceModel::from_plda(&sorted, config.vbx.lda_dim)?;
            Some(VbBackend { plda: sorted, model })
        } else {
            None
        };
        Ok(Self {
            config,
            transform,
            plda,
            vb,
        })
    }

    pub fn config(&self) -> &DiarizeConfig {
        &self.config
    }

    /// Single-stream diarization: every window is clustered on its own
    /// channel.
    pub fn diarize(&self, rec: &Recording) -> Result<Diarization, DiarizeError> {
        info!(recording = %rec.id, windows = rec.len(), init = %self.config.init, "diarizing");
        if rec.is_empty() {
            return Ok(self.finish(rec, &[], Vec::new(), None));
        }
        let x = self.prepare(rec)?;
        let reference = rec.reference.as_deref();

        let (labels, trace) = match self.config.init {
            InitMode::Spectral => (self.spectral(rec, x.view())?.labels, None),
            InitMode::Ahc => (singletons(&ahc(x.view(), &self.config.ahc)?.labels), None),
            InitMode::SpectralVb | InitMode::AhcVb => {
                let (primary, k) = if self.config.init == InitMode::AhcVb {
                    let a = ahc(x.view(), &self.config.ahc)?;
                    (a.labels, a.num_speakers)
                } else {
                    let sc = self.spectral(rec, x.view())?;
                    (sc.primary(), sc.num_speakers)
                };
                let vb = self.backend()?;
                let fea = vb.plda.features(x.view(), self.config.vbx.lda_dim)?;
                let gamma = soft_init(&primary, k.max(1), self.config.vbx.init_smoothing);
                let out = vb_hmm(
                    fea.view(),
                    &vb.model,
                    VbInit::from_gamma(gamma),
                    &self.config.vbx.options,
                    reference,
                )?;
                (singletons(&relabel(&hard_labels(out.gamma.view()))), Some(out.trace))
            }
            InitMode::Random(restarts) => {
                let vb = self.backend()?;
                let fea = vb.plda.features(x.view(), self.config.vbx.lda_dim)?;
                let out = vb_random_restarts(
                    fea.view(),
                    &vb.model,
                    &self.config.vbx.options,
                    restarts,
                    self.config.vbx.max_random_speakers,
                    self.config.vbx.init_smoothing,
                    reference,
                )?;
                (singletons(&relabel(&hard_labels(out.gamma.view()))), Some(out.trace))
            }
        };

        let windows: Vec<Window> = rec
            .channels
            .iter()
            .zip(&rec.spans)
            .zip(&labels)
            .map(|((&ch, &(s, e)), l)| Window::with_labels(ch, s, e, l.clone()))
            .collect();
        Ok(self.finish(rec, &windows, labels, trace))
    }

    /// Two-stream diarization with the coupled VB-HMM. Windows are grouped
    /// into regions by start time; stream 0 reads channel 0 and stream 1
    /// channel 1.
    ///
    /// With `spectral` or `ahc` init there is nothing to couple and this is
    /// the same as [`Diarizer::diarize`].
    pub fn diarize_coupled(&self, rec: &Recording) -> Result<Diarization, DiarizeError> {
        if !self.config.needs_vb() {
            debug!(recording = %rec.id, init = %self.config.init, "no coupled refinement");
            return self.diarize(rec);
        }
        let regions = coupled_regions(&rec.channels, &rec.spans);
        info!(recording = %rec.id, windows = rec.len(), regions = regions.len(), init = %self.config.init, "diarizing coupled");
        if regions.is_empty() {
            return Ok(self.finish(rec, &[], Vec::new(), None));
        }
        let x = self.prepare(rec)?;
        let vb = self.backend()?;
        let fea = vb.plda.features(x.view(), self.config.vbx.lda_dim)?;
        let rows: [Vec<usize>; 2] = [0, 1].map(|s| regions.iter().map(|r| r.rows[s]).collect());
        let f0 = fea.select(Axis(0), &rows[0]);
        let f1 = fea.select(Axis(0), &rows[1]);
        let opts = &self.config.coupled.options;
        let smoothing = self.config.coupled.init_smoothing;

        let out = match self.config.init {
            InitMode::Random(restarts) => coupled_random_restarts(
                [f0.view(), f1.view()],
                &vb.model,
                opts,
                restarts,
                self.config.vbx.max_random_speakers,
                smoothing,
            )?,
            _ => {
                let joined: Vec<usize> = rows[0].iter().chain(&rows[1]).copied().collect();
                let xs = x.select(Axis(0), &joined);
                let (primary, k) = if self.config.init == InitMode::AhcVb {
                    let a = ahc(xs.view(), &self.config.ahc)?;
                    (a.labels, a.num_speakers)
                } else {
                    let aff = affinity(xs.view(), self.config.similarity, self.plda.as_ref())?;
                    let sc = nme_spectral_clustering(aff.view(), None, &self.config.spectral)?;
                    (sc.primary(), sc.num_speakers)
                };
                let (p0, p1) = primary.split_at(regions.len());
                let k = k.max(1);
                let init = [soft_init(p0, k, smoothing), soft_init(p1, k, smoothing)];
                coupled_vb_hmm(&[f0.view(), f1.view()], &vb.model, Some(init), opts)?
            }
        };

        let t = regions.len();
        let mut joint = hard_labels(out.gamma[0].view());
        joint.extend(hard_labels(out.gamma[1].view()));
        let joint = relabel(&joint);
        let mut windows = Vec::with_capacity(2 * t);
        for (stream, chunk) in joint.chunks(t).enumerate() {
            for (r, &label) in regions.iter().zip(chunk) {
                windows.push(Window::new(stream, r.start, r.end, label));
            }
        }
        Ok(self.finish(rec, &windows, singletons(&joint), Some(out.trace)))
    }

    /// Diarizes every recording with [`Diarizer::diarize`], or
    /// [`Diarizer::diarize_coupled`] when `coupled`. A failing recording is
    /// logged and reported without stopping the others.
    pub fn diarize_all(&self, recs: &[Recording], coupled: bool) -> (Vec<Diarization>, Vec<RecordingFailure>) {
        let mut done = Vec::with_capacity(recs.len());
        let mut failed = Vec::new();
        for rec in recs {
            let result = if coupled { self.diarize_coupled(rec) } else { self.diarize(rec) };
            match result {
                Ok(d) => done.push(d),
                Err(e) => {
                    error!(recording = %rec.id, error = %e, "recording failed");
                    failed.push(RecordingFailure::new(&rec.id, &e));
                }
            }
        }
        (done, failed)
    }

    /// Diarizes every job, writing `<out_dir>/<recording>.rttm`. A failing
    /// job or recording is logged and skipped.
    pub fn run_batch(&self, jobs: &[BatchJob], coupled: bool, out_dir: &Path) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for job in jobs {
            if let Err(e) = self.run_job(job, coupled, out_dir, &mut summary) {
                error!(recording = %job.id, error = %e, "recording failed");
                summary.failed.push(RecordingFailure::new(&job.id, &e));
            }
        }
        info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            "batch finished"
        );
        summary
    }

    fn run_job(&self, job: &BatchJob, coupled: bool, out_dir: &Path, summary: &mut BatchSummary) -> Result<(), DiarizeError> {
        let archive = Recording::load(&job.ark, &job.segments, job.overlap.as_deref())?;
        summary.failed.extend(archive.failed);
        let (done, failed) = self.diarize_all(&archive.recordings, coupled);
        summary.failed.extend(failed);
        for d in done {
            match d.save_rttm(&out_dir.join(format!("{}.rttm", d.recording))) {
                Ok(()) => summary.succeeded.push(d.summary()),
                Err(e) => {
                    error!(recording = %d.recording, error = %e, "writing RTTM failed");
                    summary.failed.push(RecordingFailure::new(&d.recording, &e));
                }
            }
        }
        Ok(())
    }

    fn prepare(&self, rec: &Recording) -> Result<Array2<f64>, DiarizeError> {
        match &self.transform {
            Some(t) => t.apply(rec.embeddings.view()),
            None => Ok(rec.embeddings.clone()),
        }
    }

    fn spectral(&self, rec: &Recording, x: ArrayView2<f64>) -> Result<SpectralResult, DiarizeError> {
        let aff = affinity(x, self.config.similarity, self.plda.as_ref())?;
        let flags = rec
            .overlap
            .as_deref()
            .map(|iv| overlap_vector(Some(iv), &rec.spans, self.config.overlap_fraction));
        nme_spectral_clustering(aff.view(), flags.as_deref(), &self.config.spectral)
    }

    fn backend(&self) -> Result<&VbBackend, DiarizeError> {
        self.vb
            .as_ref()
            .ok_or_else(|| DiarizeError::Config(format!("init mode {} needs a PLDA model", self.config.init)))
    }

    fn finish(&self, rec: &Recording, windows: &[Window], labels: Vec<Labels>, trace: Option<VbTrace>) -> Diarization {
        let stitched = stitch(windows);
        let num_speakers = labels.iter().flatten().collect::<BTreeSet<_>>().len();
        info!(
            recording = %rec.id,
            speakers = num_speakers,
            turns = stitched.turns.len(),
            "diarized"
        );
        Diarization {
            recording: rec.id.clone(),
            labels,
            num_speakers,
            stitched,
            trace,
        }
    }
}

/// Renumbers labels in order of first appearance.
fn relabel(labels: &[usize]) -> Vec<usize> {
    let mut map: HashMap<usize, usize> = HashMap::new();
    labels
        .iter()
        .map(|&l| {
            let next = map.len();
            *map.entry(l).or_insert(next)
        })
        .collect()
}

fn singletons(labels: &[usize]) -> Vec<Labels> {
    labels.iter().map(|&l| Labels::from([l])).collect()
}

/// Input files of one batch entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchJob {
    pub id: String,
    pub ark: PathBuf,
    pub segments: PathBuf,
    pub overlap: Option<PathBuf>,
}

impl BatchJob {
    /// `<dir>/<id>.ark` and `<dir>/<id>.seg`, plus `<dir>/<id>.rttm` as
    /// overlap hypothesis when it exists.
    pub fn in_dir(dir: &Path, id: &str) -> Self {
        let overlap = dir.join(format!("{id}.rttm"));
        Self {
            id: id.to_string(),
            ark: dir.join(format!("{id}.ark")),
            segments: dir.join(format!("{id}.seg")),
            overlap: overlap.exists().then_some(overlap),
        }
    }
}

/// Reads a list of recording ids, one per line, into jobs under `dir`.
pub fn read_job_list(list: &Path, dir: &Path) -> Result<Vec<BatchJob>, DiarizeError> {
    let mut jobs = Vec::new();
    for line in BufReader::new(File::open(list)?).lines() {
        let line = line?;
        let id = line.trim();
        if id.is_empty() || id.starts_with('#') {
            continue;
        }
        jobs.push(BatchJob::in_dir(dir, id));
    }
    Ok(jobs)
}

/// Outcome of [`Diarizer::run_batch`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub succeeded: Vec<DiarizationSummary>,
    pub failed: Vec<RecordingFailure>,
}

impl BatchSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Frame-level DER of one recording.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingScore {
    pub recording: String,
    pub der: f64,
    /// Frames with a reference speaker.
    pub scored_frames: usize,
    /// Scored frames without any hypothesis speaker.
    pub missed_frames: usize,
}

/// DER over all recordings of a reference RTTM.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreReport {
    pub recordings: Vec<RecordingScore>,
    /// Frame-weighted DER over every recording.
    pub der: f64,
}

/// Scores hypothesis turns against reference turns on a `step`-second
/// grid. Only frames with a reference speaker count; frames the hypothesis
/// leaves unlabelled count as errors.
pub fn score_turns(
    recording: &str,
    reference: &[RttmRecord],
    hypothesis: &[RttmRecord],
    step: f64,
) -> Result<RecordingScore, DiarizeError> {
    if !(step > 0.0) {
        return Err(DiarizeError::Config(format!("frame step must be positive, got {step}")));
    }
    let end = reference
        .iter()
        .chain(hypothesis)
        .map(RttmRecord::end)
        .fold(0.0, f64::max);
    let frames = (end / step).ceil() as usize;
    let ref_frames = rasterize(reference, step, frames);
    let hyp_frames = rasterize(hypothesis, step, frames);

    let mut ref_ids: HashMap<&str, usize> = HashMap::new();
    let mut hyp_ids: HashMap<&str, usize> = HashMap::new();
    let mut ref_labels = Vec::new();
    let mut hyp_labels = Vec::new();
    let mut missed = 0;
    for (r, h) in ref_frames.iter().zip(&hyp_frames) {
        let Some(r) = r else { continue };
        let Some(h) = h else {
            missed += 1;
            continue;
        };
        let next = ref_ids.len();
        ref_labels.push(*ref_ids.entry(r).or_insert(next));
        let next = hyp_ids.len();
        hyp_labels.push(*hyp_ids.entry(h).or_insert(next));
    }

    let scored = ref_labels.len() + missed;
    let der = if scored == 0 {
        0.0
    } else {
        let gamma = one_hot(&hyp_labels, hyp_ids.len());
        let matched = der(gamma.view(), &ref_labels, false)?;
        (matched * ref_labels.len() as f64 + missed as f64) / scored as f64
    };
    debug!(recording, der, scored, missed, "scored");
    Ok(RecordingScore {
        recording: recording.to_string(),
        der,
        scored_frames: scored,
        missed_frames: missed,
    })
}

/// Scores every reference recording against the hypothesis records of the
/// same id. Recordings are reported in sorted order.
pub fn score_rttm(reference: Vec<RttmRecord>, hypothesis: Vec<RttmRecord>, step: f64) -> Result<ScoreReport, DiarizeError> {
    let refs = records_by_recording(reference);
    let hyps = records_by_recording(hypothesis);
    let mut ids: Vec<&String> = refs.keys().collect();
    ids.sort();

    let mut recordings = Vec::with_capacity(ids.len());
    for id in ids {
        let hyp = hyps.get(id).map_or(&[][..], Vec::as_slice);
        recordings.push(score_turns(id, &refs[id], hyp, step)?);
    }
    let frames: usize = recordings.iter().map(|r| r.scored_frames).sum();
    let der = if frames == 0 {
        0.0
    } else {
        recordings.iter().map(|r| r.der * r.scored_frames as f64).sum::<f64>() / frames as f64
    };
    Ok(ScoreReport { recordings, der })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ark::write_ark_text;
    use ndarray::Array1;

    fn timing(name: &str, rec: &str, start: f64, end: f64) -> SegmentTiming {
        SegmentTiming {
            name: name.into(),
            recording: rec.into(),
            start,
            end,
        }
    }

    fn entry(name: &str, values: &[f64]) -> ArkEntry {
        ArkEntry {
            name: name.into(),
            values: values.to_vec(),
        }
    }

    /// `per_block` windows per entry of `speakers`; speaker 0 sounds like
    /// `[1, 0, 0]`, anyone else like `[0, 0, 1]`. Windows are 1.5 s long
    /// with a 0.75 s shift.
    fn speaker_blocks(speakers: &[usize], per_block: usize) -> Recording {
        let mut entries = Vec::new();
        let mut timings = Vec::new();
        for (i, &spk) in speakers.iter().flat_map(|s| std::iter::repeat_n(s, per_block)).enumerate() {
            let name = format!("rec_0_{i:04}");
            let v = if spk == 0 { [1.0, 0.0, 0.0] } else { [0.0, 0.0, 1.0] };
            entries.push(entry(&name, &v));
            timings.push(timing(&name, "rec", 0.75 * i as f64, 0.75 * i as f64 + 1.5));
        }
        Recording::assemble("rec", entries, &timings).unwrap()
    }

    /// Two well-separated speakers: A for the first `half` windows, B after.
    fn two_speaker_recording(half: usize) -> Recording {
        speaker_blocks(&[0, 1], half)
    }

    fn write_archive(dir: &Path, stem: &str, entries: &[ArkEntry], timings: &[SegmentTiming]) {
        write_ark_text(File::create(dir.join(format!("{stem}.ark"))).unwrap(), entries).unwrap();
        let seg: String = timings
            .iter()
            .map(|t| format!("{} {} {} {}\n", t.name, t.recording, t.start, t.end))
            .collect();
        std::fs::write(dir.join(format!("{stem}.seg")), seg).unwrap();
    }

    #[test]
    fn assemble_checks_names() {
        let err = Recording::assemble(
            "rec",
            vec![entry("rec_0_1", &[1.0])],
            &[timing("rec_0_2", "rec", 0.0, 1.0)],
        )
        .unwrap_err();
        assert!(matches!(err, DiarizeError::NameMismatch { .. }));

        let err = Recording::assemble("rec", vec![entry("rec_0_1", &[1.0])], &[]).unwrap_err();
        assert!(matches!(err, DiarizeError::NameMismatch { .. }));

        let err = Recording::assemble(
            "rec",
            vec![entry("rec_0_1", &[1.0]), entry("rec_1_2", &[1.0, 2.0])],
            &[timing("rec_0_1", "rec", 0.0, 1.0), timing("rec_1_2", "rec", 0.0, 1.0)],
        )
        .unwrap_err();
        assert!(matches!(err, DiarizeError::DimensionMismatch { .. }));
    }

    #[test]
    fn assemble_reads_channels() {
        let rec = Recording::assemble(
            "rec",
            vec![entry("rec_0_1", &[1.0]), entry("rec_1_1", &[2.0])],
            &[timing("rec_0_1", "rec", 0.0, 1.0), timing("rec_1_1", "rec", 0.0, 1.0)],
        )
        .unwrap();
        assert_eq!(rec.channels, vec![0, 1]);
        assert_eq!(rec.embeddings.dim(), (2, 1));
    }

    #[test]
    fn spectral_pipeline_finds_two_speakers() {
        let rec = two_speaker_recording(10);
        let d = Diarizer::new(DiarizeConfig::default(), None, None).unwrap();
        let out = d.diarize(&rec).unwrap();
        assert_eq!(out.num_speakers, 2);
        let turns = out.timeline();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].label, 0);
        assert_eq!(turns[0].start, 0.0);
        assert!((turns[0].end - 7.875).abs() < 1e-9);
        assert_eq!(turns[1].start, turns[0].end);
        assert!((turns[1].end - (0.75 * 19.0 + 1.5)).abs() < 1e-9);

        let mut buf = Vec::new();
        out.write_rttm(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("SPEAKER rec 1 0.000 "));
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn rttm_keeps_stitcher_order() {
        let rec = speaker_blocks(&[0, 1, 0], 10);
        let d = Diarizer::new(DiarizeConfig::default(), None, None).unwrap();
        let out = d.diarize(&rec).unwrap();
        assert_eq!(out.num_speakers, 2);

        let mut buf = Vec::new();
        out.write_rttm(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let rows: Vec<(String, String)> = text
            .lines()
            .map(|l| {
                let f: Vec<&str> = l.split_whitespace().collect();
                (f[7].to_string(), f[3].to_string())
            })
            .collect();
        assert_eq!(
            rows,
            vec![
                ("0".to_string(), "0.000".to_string()),
                ("0".to_string(), "15.375".to_string()),
                ("1".to_string(), "7.875".to_string()),
            ]
        );

        let starts: Vec<f64> = out.timeline().iter().map(|t| t.start).collect();
        assert_eq!(starts, vec![0.0, 7.875, 15.375]);
    }

    #[test]
    fn load_keeps_good_recordings() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![
            entry("good_0_1", &[1.0, 0.0]),
            entry("good_0_2", &[0.0, 1.0]),
            entry("bad_0_1", &[1.0, 1.0]),
        ];
        let timings = vec![
            timing("good_0_1", "good", 0.0, 1.5),
            timing("good_0_2", "good", 0.75, 2.25),
        ];
        write_archive(dir.path(), "mix", &entries, &timings);

        let archive = Recording::load(&dir.path().join("mix.ark"), &dir.path().join("mix.seg"), None).unwrap();
        assert_eq!(archive.recordings.len(), 1);
        assert_eq!(archive.recordings[0].id, "good");
        assert_eq!(archive.recordings[0].len(), 2);
        assert_eq!(archive.failed.len(), 1);
        assert_eq!(archive.failed[0].id, "bad");
        assert!(archive.failed[0].error.contains("no timed segments"));
    }

    #[test]
    fn diarize_all_reports_each_failure() {
        let t = XvecTransform::new(Array1::zeros(3), Array1::zeros(3), Array2::eye(3)).unwrap();
        let d = Diarizer::new(DiarizeConfig::default(), Some(t), None).unwrap();
        let narrow = Recording::assemble(
            "narrow",
            vec![entry("narrow_0_1", &[1.0, 0.0])],
            &[timing("narrow_0_1", "narrow", 0.0, 1.5)],
        )
        .unwrap();
        let recs = vec![narrow, two_speaker_recording(4)];
        let (done, failed) = d.diarize_all(&recs, false);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].recording, "rec");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "narrow");
    }

    #[test]
    fn empty_and_single_window() {
        let d = Diarizer::new(DiarizeConfig::default(), None, None).unwrap();
        let empty = Recording::assemble("e", Vec::new(), &[]).unwrap();
        let out = d.diarize(&empty).unwrap();
        assert!(out.stitched.turns.is_empty());

        let one = Recording::assemble("o", vec![entry("o_0_1", &[1.0, 0.0])], &[timing("o_0_1", "o", 1.0, 2.5)]).unwrap();
        let out = d.diarize(&one).unwrap();
        assert_eq!(out.num_speakers, 1);
        assert_eq!(out.timeline(), vec![Turn { start: 1.0, end: 2.5, label: 0 }]);
    }

    #[test]
    fn vb_modes_need_plda() {
        for init in [InitMode::SpectralVb, InitMode::AhcVb, InitMode::Random(2)] {
            let cfg = DiarizeConfig {
                init,
                ..DiarizeConfig::default()
            };
            assert!(matches!(Diarizer::new(cfg, None, None), Err(DiarizeError::Config(_))));
        }
    }

    #[test]
    fn ahc_pipeline_finds_two_speakers() {
        let rec = speaker_blocks(&[0, 1, 0], 6);
        let cfg = DiarizeConfig {
            init: InitMode::Ahc,
            ..DiarizeConfig::default()
        };
        let d = Diarizer::new(cfg, None, None).unwrap();
        let out = d.diarize(&rec).unwrap();
        assert_eq!(out.num_speakers, 2);
        assert!(out.trace.is_none());
        let labels: Vec<usize> = out.labels.iter().map(|l| *l.first().unwrap()).collect();
        assert!(labels[..6].iter().chain(&labels[12..]).all(|&l| l == 0), "{labels:?}");
        assert!(labels[6..12].iter().all(|&l| l == 1), "{labels:?}");
        // Plain AHC never couples.
        assert_eq!(d.diarize_coupled(&rec).unwrap().labels, out.labels);
    }

    #[test]
    fn plda_similarity_needs_plda() {
        let cfg = DiarizeConfig {
            similarity: SimilarityKind::Plda,
            ..DiarizeConfig::default()
        };
        assert!(matches!(Diarizer::new(cfg, None, None), Err(DiarizeError::Config(_))));
    }

    #[test]
    fn transform_and_plda_dims_must_agree() {
        let t = XvecTransform::new(Array1::zeros(3), Array1::zeros(3), Array2::eye(3)).unwrap();
        let p = Plda::isotropic(2, 1.0).unwrap();
        assert!(matches!(
            Diarizer::new(DiarizeConfig::default(), Some(t), Some(p)),
            Err(DiarizeError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn regions_group_by_start() {
        let channels = [0, 1, 0, 1, 0];
        let spans = [(0.0, 1.5), (0.0, 1.5), (0.75, 2.25), (1.5, 3.0), (1.5, 3.0)];
        let regions = coupled_regions(&channels, &spans);
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].rows, [0, 1]);
        assert_eq!(regions[1].rows, [2, 2]);
        assert_eq!(regions[2].rows, [4, 3]);
    }

    #[test]
    fn reference_labels_by_midpoint() {
        let rec = two_speaker_recording(2);
        let refs = read_rttm(
            "SPEAKER rec 1 0.0 1.5 <NA> <NA> spkA <NA> <NA>\nSPEAKER rec 1 1.5 1.5 <NA> <NA> spkB <NA> <NA>\n".as_bytes(),
            "mem",
        )
        .unwrap();
        let rec = rec.with_reference(&refs);
        // midpoints 0.75, 1.5, 2.25, 3.0
        assert_eq!(rec.reference, Some(vec![0, 1, 1, 2]));
    }

    #[test]
    fn relabel_by_first_appearance() {
        assert_eq!(relabel(&[4, 4, 1, 7, 1]), vec![0, 0, 1, 2, 1]);
    }

    #[test]
    fn scoring_counts_misses() {
        let reference = read_rttm(
            "SPEAKER r 1 0.0 1.0 <NA> <NA> A <NA> <NA>\nSPEAKER r 1 1.0 1.0 <NA> <NA> B <NA> <NA>\n".as_bytes(),
            "mem",
        )
        .unwrap();
        let hyp = read_rttm("SPEAKER r 1 0.0 1.0 <NA> <NA> 7 <NA> <NA>\n".as_bytes(), "mem").unwrap();
        let s = score_turns("r", &reference, &hyp, 0.1).unwrap();
        assert_eq!(s.scored_frames, 20);
        assert_eq!(s.missed_frames, 10);
        assert!((s.der - 0.5).abs() < 1e-12);

        let report = score_rttm(reference.clone(), reference, 0.1).unwrap();
        assert_eq!(report.der, 0.0);
        assert!(score_turns("r", &[], &[], 0.0).is_err());
    }

    #[test]
    fn batch_continues_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let rec = two_speaker_recording(4);
        let mut entries: Vec<ArkEntry> = rec
            .names
            .iter()
            .zip(rec.embeddings.rows())
            .map(|(n, r)| entry(n, r.as_slice().unwrap()))
            .collect();
        let timings: Vec<SegmentTiming> = rec
            .names
            .iter()
            .zip(&rec.spans)
            .map(|(n, &(s, e))| timing(n, "rec", s, e))
            .collect();
        entries.push(entry("untimed_0_1", &[1.0, 0.0, 0.0]));
        write_archive(dir.path(), "good", &entries, &timings);
        std::fs::write(dir.path().join("list"), "missing\ngood\n").unwrap();

        let jobs = read_job_list(&dir.path().join("list"), dir.path()).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[1].overlap.is_none());

        let d = Diarizer::new(DiarizeConfig::default(), None, None).unwrap();
        let summary = d.run_batch(&jobs, false, dir.path());
        assert!(!summary.all_succeeded());
        assert_eq!(summary.failed[0].id, "missing");
        assert_eq!(summary.failed[1].id, "untimed");
        assert_eq!(summary.succeeded.len(), 1);
        assert!(dir.path().join("rec.rttm").exists());
    }
}
