use crate::common::*;

/// Wide self-attention across the camera views.
#[derive(Debug, Clone)]
pub struct SharedDecoderInit {
    /// Length of each view encoding.
    pub dim: usize,
    pub heads: usize,
}

impl SharedDecoderInit {
    pub fn build<'p, P>(self, path: P) -> Result<SharedDecoder>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self { dim, heads } = self;
        ensure!(dim > 0, "dim must be positive");
        ensure!(heads > 0, "heads must be positive");

        let (dim, heads) = (dim as i64, heads as i64);
        let no_bias = || nn::LinearConfig {
            bias: false,
            ..Default::default()
        };

        Ok(SharedDecoder {
            to_keys: nn::linear(path / "to_keys", dim, heads * dim, no_bias()),
            to_queries: nn::linear(path / "to_queries", dim, heads * dim, no_bias()),
            to_values: nn::linear(path / "to_values", dim, heads * dim, no_bias()),
            unify_heads: nn::linear(path / "unify_heads", heads * dim, dim, Default::default()),
            final_layer: nn::linear(path / "final_layer", dim, dim, Default::default()),
            dim,
            heads,
        })
    }
}

#[derive(Debug)]
pub struct SharedDecoder {
    to_keys: nn::Linear,
    to_queries: nn::Linear,
    to_values: nn::Linear,
    unify_heads: nn::Linear,
    final_layer: nn::Linear,
    dim: i64,
    heads: i64,
}

impl SharedDecoder {
    /// Mixes `[N, V, dim]` view encodings and returns the same shape.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let Self { dim, heads, .. } = *self;
        let (batch_size, num_views, input_dim) = xs.size3()?;
        ensure!(
            input_dim == dim,
            "expect encodings of length {}, but get {}",
            dim,
            input_dim
        );

        // [N, V, H * E] -> [N * H, V, E]
        let split_heads = |xs: Tensor| {
            xs.view([batch_size, num_views, heads, dim])
                .transpose(1, 2)
                .contiguous()
                .view([batch_size * heads, num_views, dim])
        };

        let scale = (dim as f64).powf(0.25);
        let keys = split_heads(xs.apply(&self.to_keys)) / scale;
        let queries = split_heads(xs.apply(&self.to_queries)) / scale;
        let values = split_heads(xs.apply(&self.to_values));

        // row-wise attention over views
        let attention = queries
            .bmm(&keys.transpose(1, 2))
            .softmax(2, Kind::Float);

        let output = attention
            .bmm(&values)
            .view([batch_size, heads, num_views, dim])
            .transpose(1, 2)
            .contiguous()
            .view([batch_size, num_views, heads * dim])
            .apply(&self.unify_heads)
            .apply(&self.final_layer)
            .leaky_relu();

        Ok(output)
    }
}
