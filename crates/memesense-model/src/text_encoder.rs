//! Caption branch: embedding, bidirectional LSTM, max pooling over time.

use candle_core::{Module, Tensor};
use candle_nn::rnn::{Direction, LSTMConfig, LSTM};
use candle_nn::{Embedding, VarBuilder, RNN};

/// Bidirectional LSTM caption encoder.
///
/// `[B, T]` token ids → `[B, T, E]` embeddings → forward and backward LSTM
/// outputs concatenated to `[B, T, 2H]` → max over time → `[B, 2H]`.
pub struct TextEncoder {
    embedding: Embedding,
    forward_lstm: LSTM,
    backward_lstm: LSTM,
    hidden: usize,
}

impl TextEncoder {
    pub fn new(
        vocab_size: usize,
        embedding_dim: usize,
        hidden: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let embedding = candle_nn::embedding(vocab_size, embedding_dim, vb.pp("embedding"))?;
        let forward_lstm = candle_nn::rnn::lstm(
            embedding_dim,
            hidden,
            LSTMConfig::default(),
            vb.pp("lstm"),
        )?;
        let backward_lstm = candle_nn::rnn::lstm(
            embedding_dim,
            hidden,
            LSTMConfig {
                direction: Direction::Backward,
                ..LSTMConfig::default()
            },
            vb.pp("lstm"),
        )?;
        Ok(Self {
            embedding,
            forward_lstm,
            backward_lstm,
            hidden,
        })
    }

    /// Width of the pooled output.
    pub fn output_dim(&self) -> usize {
        2 * self.hidden
    }

    /// Per-timestep bidirectional states, `[B, T, 2H]`.
    pub fn sequence(&self, token_ids: &Tensor) -> candle_core::Result<Tensor> {
        let embedded = self.embedding.forward(token_ids)?;
        let steps = embedded.dim(1)?;

        let forward_states = self.forward_lstm.seq(&embedded)?;
        let forward = self.forward_lstm.states_to_tensor(&forward_states)?;

        let reversed = reverse_time(&embedded, steps)?;
        let backward_states = self.backward_lstm.seq(&reversed)?;
        let backward = self.backward_lstm.states_to_tensor(&backward_states)?;
        let backward = reverse_time(&backward, steps)?;

        Tensor::cat(&[&forward, &backward], 2)
    }
}

impl Module for TextEncoder {
    fn forward(&self, token_ids: &Tensor) -> candle_core::Result<Tensor> {
        self.sequence(token_ids)?.max(1)
    }
}

fn reverse_time(xs: &Tensor, steps: usize) -> candle_core::Result<Tensor> {
    let idx: Vec<u32> = (0..steps as u32).rev().collect();
    let idx = Tensor::from_vec(idx, steps, xs.device())?;
    xs.index_select(&idx, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn encoder(varmap: &VarMap) -> TextEncoder {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        TextEncoder::new(20, 8, 6, vb.pp("text")).unwrap()
    }

    fn ids(rows: &[[u32; 5]]) -> Tensor {
        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), 5), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_output_shapes() {
        let varmap = VarMap::new();
        let enc = encoder(&varmap);
        let tokens = ids(&[[2, 3, 4, 0, 0], [5, 1, 0, 0, 0], [7, 8, 9, 10, 11]]);
        assert_eq!(enc.sequence(&tokens).unwrap().dims(), &[3, 5, 12]);
        assert_eq!(enc.forward(&tokens).unwrap().dims(), &[3, enc.output_dim()]);
    }

    #[test]
    fn test_both_directions_have_their_own_weights() {
        let varmap = VarMap::new();
        let _enc = encoder(&varmap);
        let vars = varmap.data().lock().unwrap();
        assert!(vars.contains_key("text.lstm.weight_ih_l0"));
        assert!(vars.contains_key("text.lstm.weight_ih_l0_reverse"));
        assert!(vars.contains_key("text.embedding.weight"));
    }

    #[test]
    fn test_backward_state_at_last_step_only_sees_last_token() {
        let varmap = VarMap::new();
        let enc = encoder(&varmap);
        // same suffix, different first token
        let a = enc.sequence(&ids(&[[2, 3, 4, 5, 6]])).unwrap();
        let b = enc.sequence(&ids(&[[9, 3, 4, 5, 6]])).unwrap();
        let last_step = |t: &Tensor, start: usize| -> Vec<f32> {
            t.narrow(1, 4, 1)
                .and_then(|t| t.narrow(2, start, 6))
                .and_then(|t| t.flatten_all())
                .and_then(|t| t.to_vec1())
                .unwrap()
        };
        let last_backward = |t: &Tensor| last_step(t, 6);
        let last_forward = |t: &Tensor| last_step(t, 0);
        // the backward state at the last step only saw token 6
        assert_eq!(last_backward(&a), last_backward(&b));
        // the forward state at the last step saw the differing first token
        assert_ne!(last_forward(&a), last_forward(&b));
    }
}
