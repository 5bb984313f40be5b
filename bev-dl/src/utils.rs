//! Tensor helpers.

use crate::common::*;

pub trait TensorExt {
    fn is_empty(&self) -> bool;

    /// Copies the tensor to a flat host vector, detached from the graph.
    fn to_f32_vec(&self) -> Vec<f32>;

    /// Copies the tensor to a flat host vector of integers.
    fn to_i64_vec(&self) -> Vec<i64>;
}

impl TensorExt for Tensor {
    fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    fn to_f32_vec(&self) -> Vec<f32> {
        let flat = tch::no_grad(|| {
            self.detach()
                .to_device(Device::Cpu)
                .to_kind(Kind::Float)
                .contiguous()
                .view([-1])
        });
        Vec::<f32>::from(&flat)
    }

    fn to_i64_vec(&self) -> Vec<i64> {
        let flat = tch::no_grad(|| {
            self.detach()
                .to_device(Device::Cpu)
                .to_kind(Kind::Int64)
                .contiguous()
                .view([-1])
        });
        Vec::<i64>::from(&flat)
    }
}

/// Builds a host index tensor on the given device.
pub fn index_tensor(indexes: &[i64], device: Device) -> Tensor {
    Tensor::of_slice(indexes)
        .set_requires_grad(false)
        .to_device(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_copy_of_strided_tensor() {
        let tensor = Tensor::of_slice(&[1f32, 2.0, 3.0, 4.0, 5.0, 6.0]).view([2, 3]);
        let transposed = tensor.transpose(0, 1);
        assert_eq!(transposed.to_f32_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert!(!transposed.is_empty());
        assert!(Tensor::zeros(&[0, 4], FLOAT_CPU).is_empty());
    }
}
