//! End-to-end decode loops driven by scripted logits.

use ndarray::Array1;

use crate::context::Device;
use crate::params::SearchParams;
use crate::processors::{MinLength, RepetitionPenalty};
use crate::roaming::RoamingArray;
use crate::sampling::log_softmax_1d_inplace;
use crate::search::{BeamSearch, GreedySearch};

/// One-position logits where each row strongly favors one token.
fn oracle_logits(favored: &[u32], vocab_size: usize) -> RoamingArray<f32> {
    let mut data = vec![0.0f32; favored.len() * vocab_size];
    for (row, &token) in favored.iter().enumerate() {
        data[row * vocab_size + token as usize] = 10.0;
    }
    RoamingArray::from_host(data)
}

/// The same raw logits row for every beam row, one position.
fn uniform_logits(row: &[f32], rows: usize) -> RoamingArray<f32> {
    let mut data = Vec::with_capacity(rows * row.len());
    for _ in 0..rows {
        data.extend_from_slice(row);
    }
    RoamingArray::from_host(data)
}

fn log_probs(row: &[f32]) -> Array1<f32> {
    let mut out = Array1::from_vec(row.to_vec());
    log_softmax_1d_inplace(&mut out);
    out
}

#[test]
fn test_greedy_single_batch_runs_to_max_length() {
    let _ = env_logger::builder().is_test(true).try_init();
    let params = SearchParams {
        batch_size: 1,
        num_beams: 1,
        sequence_length: 4,
        max_length: 10,
        vocab_size: 1000,
        eos_token_id: 999,
        input_ids: vec![0, 0, 0, 52],
        ..Default::default()
    };
    let mut search = GreedySearch::new(params, Device::Cpu).unwrap();

    let mut steps = 0;
    while !search.is_done() {
        let mut logits = oracle_logits(&[204], 1000);
        search.set_logits(&mut logits).unwrap();
        search.select_top();
        steps += 1;
        assert!(steps <= 6, "must terminate within max_length - prompt steps");
    }

    let mut sequence = search.sequence(0);
    assert_eq!(
        sequence.as_host().unwrap(),
        &[0, 0, 0, 52, 204, 204, 204, 204, 204, 204]
    );
    assert_eq!(search.sequence_length(), 10);
}

#[test]
fn test_greedy_two_batches_diverge() {
    let params = SearchParams {
        batch_size: 2,
        num_beams: 1,
        sequence_length: 4,
        max_length: 10,
        vocab_size: 1000,
        eos_token_id: 999,
        input_ids: vec![0, 0, 0, 52, 0, 0, 195, 731],
        ..Default::default()
    };
    let mut search = GreedySearch::new(params, Device::Cpu).unwrap();

    // First call carries the full prompt: shape (2, 4, 1000). Earlier
    // positions favor a junk token; only the last position may be used.
    let vocab = 1000usize;
    let mut first = vec![0.0f32; 2 * 4 * vocab];
    for row in 0..2 {
        for pos in 0..4 {
            let favored = if pos == 3 {
                if row == 0 { 204 } else { 731 }
            } else {
                998
            };
            first[(row * 4 + pos) * vocab + favored] = 10.0;
        }
    }
    let mut logits = RoamingArray::from_host(first);
    search.set_logits(&mut logits).unwrap();
    search.select_top();

    while !search.is_done() {
        let mut logits = oracle_logits(&[204, 114], 1000);
        search.set_logits(&mut logits).unwrap();
        search.select_top();
    }

    assert_eq!(
        search.sequence(0).as_host().unwrap(),
        &[0, 0, 0, 52, 204, 204, 204, 204, 204, 204]
    );
    assert_eq!(
        search.sequence(1).as_host().unwrap(),
        &[0, 0, 195, 731, 731, 114, 114, 114, 114, 114]
    );
}

#[test]
fn test_greedy_eos_pads_finished_rows() {
    let params = SearchParams {
        batch_size: 2,
        num_beams: 1,
        sequence_length: 2,
        max_length: 10,
        vocab_size: 200,
        eos_token_id: 100,
        pad_token_id: 0,
        input_ids: vec![1, 2, 3, 4],
        ..Default::default()
    };
    let mut search = GreedySearch::new(params, Device::Cpu).unwrap();

    // row 0 hits EOS immediately; row 1 only on its fifth step
    let script: [[u32; 2]; 5] = [[100, 7], [5, 7], [5, 7], [5, 7], [5, 100]];
    for favored in &script {
        assert!(!search.is_done());
        let mut logits = oracle_logits(favored, 200);
        search.set_logits(&mut logits).unwrap();
        search.select_top();
    }

    assert!(search.is_done(), "all rows saw eos");
    assert_eq!(
        search.sequence(0).as_host().unwrap(),
        &[1, 2, 100, 0, 0, 0, 0]
    );
    assert_eq!(
        search.sequence(1).as_host().unwrap(),
        &[3, 4, 7, 7, 7, 7, 100]
    );
}

#[test]
fn test_min_length_holds_eos_back() {
    let params = SearchParams {
        batch_size: 1,
        num_beams: 1,
        sequence_length: 2,
        max_length: 10,
        vocab_size: 4,
        eos_token_id: 3,
        input_ids: vec![1, 2],
        ..Default::default()
    };
    let mut search = GreedySearch::new(params, Device::Cpu).unwrap();
    search.add_processor(Box::new(MinLength { min_length: 5 }));

    // the model prefers EOS at every step
    while !search.is_done() {
        let mut logits = oracle_logits(&[3], 4);
        search.set_logits(&mut logits).unwrap();
        search.select_top();
    }

    let mut sequence = search.sequence(0);
    let tokens = sequence.as_host().unwrap();
    assert_eq!(tokens, &[1, 2, 0, 0, 0, 3]);
    assert!(
        !tokens[..5].contains(&3),
        "eos must not appear before min_length"
    );
}

#[test]
fn test_repetition_penalty_rescales_seen_tokens() {
    let params = SearchParams {
        batch_size: 1,
        num_beams: 1,
        sequence_length: 2,
        max_length: 10,
        vocab_size: 9,
        eos_token_id: 4,
        input_ids: vec![7, 7],
        ..Default::default()
    };
    let mut search = GreedySearch::new(params, Device::Cpu).unwrap();
    search.add_processor(Box::new(RepetitionPenalty { penalty: 2.0 }));

    // Choose raw logits so tokens 7 and 8 land at exactly -1.0 after
    // log-softmax: with logits {ln(e-2), 0, 0} the partition sum is e.
    let mut row = vec![-1e9f32; 9];
    row[0] = (std::f32::consts::E - 2.0).ln();
    row[7] = 0.0;
    row[8] = 0.0;
    let mut logits = uniform_logits(&row, 1);
    search.set_logits(&mut logits).unwrap();

    let scores = search.scores(0);
    assert!((scores[7] - (-2.0)).abs() < 1e-4, "seen token halved: {}", scores[7]);
    assert!((scores[8] - (-1.0)).abs() < 1e-4, "unseen token unchanged: {}", scores[8]);
}

#[test]
fn test_beam_search_repeated_token_tail() {
    let params = SearchParams {
        batch_size: 1,
        num_beams: 2,
        sequence_length: 2,
        max_length: 6,
        vocab_size: 4,
        eos_token_id: 3,
        length_penalty: 1.0,
        input_ids: vec![0, 1],
        ..Default::default()
    };
    let mut search = BeamSearch::new(params, Device::Cpu).unwrap();

    // token 1 dominates, EOS is unreachable
    let raw = [0.0f32, 2.0, 0.0, -1e9];
    let mut steps = 0;
    while !search.is_done() {
        let mut logits = uniform_logits(&raw, 2);
        search.set_logits(&mut logits).unwrap();
        search.select_top();
        steps += 1;
        assert!(steps <= 4);
    }
    assert_eq!(steps, 4, "runs to max_length without eos");

    let mut out = vec![0u32; 6];
    let mut out_scores = vec![0.0f32; 1];
    search.finalize(1, &mut out, Some(&mut out_scores)).unwrap();
    assert_eq!(out, vec![0, 1, 1, 1, 1, 1]);

    // best hypothesis accumulated token 1's log-prob four times, normalized
    // by the full sequence length
    let lp = log_probs(&raw);
    let expected = 4.0 * lp[1] / 6.0;
    assert!((out_scores[0] - expected).abs() < 1e-4);
}

#[test]
fn test_beam_search_reindexes_histories() {
    let params = SearchParams {
        batch_size: 1,
        num_beams: 2,
        sequence_length: 2,
        max_length: 8,
        vocab_size: 4,
        eos_token_id: 3,
        input_ids: vec![0, 1],
        ..Default::default()
    };
    let mut search = BeamSearch::new(params, Device::Cpu).unwrap();

    let raw = [0.0f32, 2.0, 1.0, -1e9];
    let mut logits = uniform_logits(&raw, 2);
    search.set_logits(&mut logits).unwrap();
    search.select_top();

    // first step diverges off beam 0 only
    assert_eq!(search.sequence(0).as_host().unwrap(), &[0, 1, 1]);
    assert_eq!(search.sequence(1).as_host().unwrap(), &[0, 1, 2]);

    let mut logits = uniform_logits(&raw, 2);
    search.set_logits(&mut logits).unwrap();
    search.select_top();

    // both survivors chain off the stronger beam 0
    assert_eq!(search.next_indices().as_host().unwrap(), &[0, 0]);
    assert_eq!(search.sequence(0).as_host().unwrap(), &[0, 1, 1, 1]);
    assert_eq!(search.sequence(1).as_host().unwrap(), &[0, 1, 1, 2]);
}

#[test]
fn test_beam_search_eos_finalizes_and_early_stops() {
    let params = SearchParams {
        batch_size: 1,
        num_beams: 2,
        sequence_length: 2,
        max_length: 8,
        vocab_size: 4,
        eos_token_id: 3,
        pad_token_id: 0,
        length_penalty: 1.0,
        early_stopping: true,
        input_ids: vec![0, 1],
        ..Default::default()
    };
    let mut search = BeamSearch::new(params, Device::Cpu).unwrap();

    // EOS is always the best continuation
    let raw = [0.0f32, 1.0, 0.5, 2.0];
    let mut steps = 0;
    while !search.is_done() {
        let mut logits = uniform_logits(&raw, 2);
        search.set_logits(&mut logits).unwrap();
        search.select_top();
        steps += 1;
        assert!(steps <= 8);
    }
    assert_eq!(steps, 2, "pool fills after two steps of eos candidates");
    assert!(search.sequence_length() < 8, "stopped before max_length");

    let mut out = vec![9u32; 8];
    let mut out_scores = vec![0.0f32; 1];
    search.finalize(1, &mut out, Some(&mut out_scores)).unwrap();

    // the first-step EOS off the bare prompt wins: shortest, least mass lost
    assert_eq!(&out[..2], &[0, 1]);
    assert!(out[2..].iter().all(|&t| t == 0), "padded to max_length");
    let lp = log_probs(&raw);
    let expected = lp[3] / 2.0;
    assert!((out_scores[0] - expected).abs() < 1e-4);
}

#[test]
fn test_selection_after_done_is_a_noop() {
    let params = SearchParams {
        batch_size: 1,
        num_beams: 1,
        sequence_length: 2,
        max_length: 3,
        vocab_size: 4,
        eos_token_id: 3,
        input_ids: vec![1, 2],
        ..Default::default()
    };
    let mut search = GreedySearch::new(params, Device::Cpu).unwrap();
    let mut logits = oracle_logits(&[1], 4);
    search.set_logits(&mut logits).unwrap();
    search.select_top();
    assert!(search.is_done());

    search.select_top();
    assert_eq!(search.sequence_length(), 3);
}

#[test]
fn test_sampling_is_reproducible_with_fixed_seed() {
    let params = SearchParams {
        batch_size: 1,
        num_beams: 1,
        sequence_length: 2,
        max_length: 8,
        vocab_size: 16,
        eos_token_id: 15,
        input_ids: vec![1, 2],
        ..Default::default()
    };

    let run = |seed: u64| {
        let mut search =
            GreedySearch::with_seed(params.clone(), Device::Cpu, seed).unwrap();
        let raw: Vec<f32> = (0..16).map(|i| (i as f32) * 0.3).collect();
        while !search.is_done() {
            let mut logits = uniform_logits(&raw, 1);
            search.set_logits(&mut logits).unwrap();
            search.sample_top_k(4, 0.8);
        }
        search.sequence(0).as_host().unwrap().to_vec()
    };

    assert_eq!(run(11), run(11));
}
